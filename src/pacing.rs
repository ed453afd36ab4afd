//! Request pacing and backoff
//!
//! The upstream service throttles bursty, fixed-cadence clients, so
//! inter-request delays are drawn from bounded random distributions: a
//! base delay per request, an occasional longer "reading" pause, and a
//! rare session break. State is aggregate across all workers; pacing
//! throttles the process, not each worker. Purely advisory timing: it
//! delays work, never cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::PacingConfig;
use crate::model::Termination;

pub struct Pacer {
    config: PacingConfig,
    last_request: Mutex<Option<Instant>>,
    requests: AtomicU64,
    waited_ms: AtomicU64,
    session_breaks: AtomicU64,
}

/// Aggregate pacing counters for the run summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PacingStats {
    pub requests: u64,
    pub total_wait_secs: f64,
    pub session_breaks: u64,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
            requests: AtomicU64::new(0),
            waited_ms: AtomicU64::new(0),
            session_breaks: AtomicU64::new(0),
        }
    }

    /// Delay before the next outbound request. Enforces the shared minimum
    /// interval first, then sleeps a randomized delay.
    pub async fn wait(&self) {
        let min_interval = Duration::from_millis(self.config.min_interval_ms);
        {
            let mut last = self.last_request.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < min_interval {
                    tokio::time::sleep(min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        let delay = self.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "pacing before next request");
        tokio::time::sleep(delay).await;

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.waited_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn next_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let mut ms = rng.gen_range(self.config.min_delay_ms..=self.config.max_delay_ms);

        if rng.gen::<f64>() < self.config.pause_chance {
            ms += rng.gen_range(self.config.pause_min_ms..=self.config.pause_max_ms);
        }
        if rng.gen::<f64>() < self.config.break_chance {
            ms += rng.gen_range(self.config.break_min_ms..=self.config.break_max_ms);
            self.session_breaks.fetch_add(1, Ordering::Relaxed);
        }

        Duration::from_millis(ms)
    }

    /// Delay for retry `attempt` (0-indexed): `base * 2^attempt` plus
    /// jitter, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=1_000);
        Duration::from_millis((exp + jitter).min(self.config.backoff_cap_ms))
    }

    pub async fn backoff(&self, attempt: u32) {
        let delay = self.backoff_delay(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "backing off after fetch failure"
        );
        tokio::time::sleep(delay).await;
        self.waited_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PacingStats {
        PacingStats {
            requests: self.requests.load(Ordering::Relaxed),
            total_wait_secs: self.waited_ms.load(Ordering::Relaxed) as f64 / 1_000.0,
            session_breaks: self.session_breaks.load(Ordering::Relaxed),
        }
    }
}

/// Limits that end pagination early. Natural exhaustion (no next cursor)
/// is the collector's own business.
#[derive(Debug, Clone, Default)]
pub struct StopPolicy {
    /// Consecutive pages yielding no new record.
    pub empty_page_limit: Option<u32>,
    pub page_limit: Option<u32>,
    /// Total records collected this run.
    pub record_limit: Option<usize>,
    /// Wall-clock budget for the run.
    pub deadline: Option<Duration>,
    /// Stop once a whole page is older than this instant.
    pub cutoff: Option<DateTime<Utc>>,
}

impl StopPolicy {
    pub fn check(
        &self,
        records: usize,
        empty_run: u32,
        pages: u32,
        elapsed: Duration,
    ) -> Option<Termination> {
        if let Some(limit) = self.empty_page_limit {
            if empty_run >= limit {
                return Some(Termination::EmptyPages);
            }
        }
        if let Some(limit) = self.page_limit {
            if pages >= limit {
                return Some(Termination::PageLimit);
            }
        }
        if let Some(limit) = self.record_limit {
            if records >= limit {
                return Some(Termination::RecordLimit);
            }
        }
        if let Some(deadline) = self.deadline {
            if elapsed >= deadline {
                return Some(Termination::Deadline);
            }
        }
        None
    }
}
