//! Pagination engine
//!
//! Drives a `PageSource` until the cursor runs out or the stop policy
//! trips, deduplicating by record id within the run and retrying
//! transient failures with backoff. A failed page range never discards
//! what earlier pages produced; it is recorded and the run ends with
//! `Termination::Aborted`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Record, Termination};
use crate::pacing::{Pacer, StopPolicy};
use crate::source::{FetchError, Page, PageSource};

/// A page range given up on, kept so the run can be resumed or audited.
#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub page: u32,
    pub cursor: Option<String>,
    pub attempts: u32,
    pub fatal: bool,
    pub error: String,
}

/// Everything one pagination run produced.
#[derive(Debug)]
pub struct Harvest<R> {
    pub records: Vec<R>,
    pub pages: u32,
    pub duplicates: u32,
    pub termination: Termination,
    pub failures: Vec<FetchFailure>,
    pub duration: Duration,
}

pub struct Collector {
    pacer: Arc<Pacer>,
    max_retries: u32,
}

impl Collector {
    pub fn new(pacer: Arc<Pacer>, max_retries: u32) -> Self {
        Self { pacer, max_retries }
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// Collect every page the source will give us, within policy.
    pub async fn collect<S>(
        &self,
        source: &mut S,
        stop: &StopPolicy,
        cancel: &CancellationToken,
    ) -> Harvest<S::Record>
    where
        S: PageSource,
        S::Record: Record,
    {
        let started = Instant::now();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut records: Vec<S::Record> = Vec::new();
        let mut failures: Vec<FetchFailure> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages: u32 = 0;
        let mut duplicates: u32 = 0;
        let mut empty_run: u32 = 0;

        let termination = loop {
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if let Some(reason) = stop.check(records.len(), empty_run, pages, started.elapsed()) {
                break reason;
            }

            if pages > 0 {
                self.pacer.wait().await;
            }

            let page = match self
                .fetch_with_retry(source, cursor.as_deref(), pages + 1, &mut failures)
                .await
            {
                Ok(page) => page,
                Err(_) => break Termination::Aborted,
            };
            pages += 1;

            let page_size = page.records.len();
            let page_newest = page.records.iter().filter_map(|r| r.activity_ts()).max();

            let mut fresh: u32 = 0;
            for record in page.records {
                if seen.insert(record.record_id()) {
                    records.push(record);
                    fresh += 1;
                } else {
                    duplicates += 1;
                }
            }
            if fresh == 0 {
                empty_run += 1;
            } else {
                empty_run = 0;
            }
            debug!(
                page = pages,
                new = fresh,
                total = records.len(),
                "page collected"
            );

            // Pages arrive newest-first; once a whole page predates the
            // cutoff, everything after it does too.
            if let Some(cutoff) = stop.cutoff {
                if page_size > 0 && page_newest.map_or(false, |ts| ts < cutoff) {
                    break Termination::ReachedCutoff;
                }
            }

            cursor = match page.next_cursor {
                Some(next) => Some(next),
                None => break Termination::Exhausted,
            };
        };

        let duration = started.elapsed();
        info!(
            records = records.len(),
            pages,
            duplicates,
            termination = termination.as_str(),
            "collection finished"
        );

        Harvest {
            records,
            pages,
            duplicates,
            termination,
            failures,
            duration,
        }
    }

    /// One page with bounded retries. Transient errors back off and retry;
    /// fatal errors and retry exhaustion surface as failure entries.
    async fn fetch_with_retry<S>(
        &self,
        source: &mut S,
        cursor: Option<&str>,
        page: u32,
        failures: &mut Vec<FetchFailure>,
    ) -> Result<Page<S::Record>, FetchError>
    where
        S: PageSource,
    {
        let mut attempt: u32 = 0;
        loop {
            match source.next_page(cursor).await {
                Ok(page) => return Ok(page),
                Err(FetchError::Fatal(reason)) => {
                    warn!(page, %reason, "fatal fetch error");
                    failures.push(FetchFailure {
                        page,
                        cursor: cursor.map(String::from),
                        attempts: attempt + 1,
                        fatal: true,
                        error: reason.clone(),
                    });
                    return Err(FetchError::Fatal(reason));
                }
                Err(FetchError::Retryable(reason)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(page, attempts = attempt, %reason, "retries exhausted");
                        failures.push(FetchFailure {
                            page,
                            cursor: cursor.map(String::from),
                            attempts: attempt,
                            fatal: false,
                            error: reason,
                        });
                        return Err(FetchError::Retryable(
                            "retries exhausted".to_string(),
                        ));
                    }
                    self.pacer.backoff(attempt - 1).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::config::PacingConfig;
    use crate::model::{Conversation, Message};

    /// In-memory source that serves a script of page results.
    pub(crate) struct ScriptedSource<R> {
        script: VecDeque<Result<Page<R>, FetchError>>,
        pub calls: u32,
    }

    impl<R> ScriptedSource<R> {
        pub fn new(script: Vec<Result<Page<R>, FetchError>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl<R: Send> PageSource for ScriptedSource<R> {
        type Record = R;

        async fn next_page(&mut self, _cursor: Option<&str>) -> Result<Page<R>, FetchError> {
            self.calls += 1;
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(Page {
                    records: Vec::new(),
                    next_cursor: None,
                }))
        }
    }

    pub(crate) fn message(id: i64, conversation_id: i64) -> Message {
        Message {
            id,
            conversation_id,
            sender: Default::default(),
            kind: Default::default(),
            body: format!("message {id}"),
            created_at: "2025-11-01T10:00:00Z".to_string(),
            receiver_read: false,
        }
    }

    pub(crate) fn page<R>(records: Vec<R>, next: Option<&str>) -> Result<Page<R>, FetchError> {
        Ok(Page {
            records,
            next_cursor: next.map(String::from),
        })
    }

    fn collector() -> Collector {
        Collector::new(Arc::new(Pacer::new(PacingConfig::immediate())), 2)
    }

    #[tokio::test]
    async fn test_collects_until_exhausted() {
        let mut source = ScriptedSource::new(vec![
            page(vec![message(1, 5), message(2, 5)], Some("a")),
            page(vec![message(3, 5)], None),
        ]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::Exhausted);
        assert_eq!(harvest.pages, 2);
        assert_eq!(harvest.records.len(), 3);
        assert!(harvest.failures.is_empty());
    }

    #[tokio::test]
    async fn test_dedups_within_run() {
        let mut source = ScriptedSource::new(vec![
            page(vec![message(1, 5), message(2, 5)], Some("a")),
            // Overlapping page, as the API hands back on re-scroll
            page(vec![message(2, 5), message(3, 5)], None),
        ]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &CancellationToken::new())
            .await;

        assert_eq!(harvest.records.len(), 3);
        assert_eq!(harvest.duplicates, 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut source = ScriptedSource::new(vec![
            Err(FetchError::Retryable("timeout".to_string())),
            Err(FetchError::Retryable("timeout".to_string())),
            page(vec![message(1, 5)], None),
        ]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::Exhausted);
        assert_eq!(harvest.records.len(), 1);
        assert_eq!(source.calls, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_keeps_prior_pages() {
        let mut source = ScriptedSource::new(vec![
            page(vec![message(1, 5), message(2, 5)], Some("a")),
            Err(FetchError::Retryable("timeout".to_string())),
            Err(FetchError::Retryable("timeout".to_string())),
            Err(FetchError::Retryable("timeout".to_string())),
        ]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::Aborted);
        assert_eq!(harvest.records.len(), 2);
        assert_eq!(harvest.failures.len(), 1);
        assert!(!harvest.failures[0].fatal);
        assert_eq!(harvest.failures[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_without_retry() {
        let mut source: ScriptedSource<Message> = ScriptedSource::new(vec![Err(FetchError::Fatal(
            "401 Unauthorized".to_string(),
        ))]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::Aborted);
        assert_eq!(source.calls, 1);
        assert!(harvest.failures[0].fatal);
    }

    #[tokio::test]
    async fn test_empty_page_limit_stops() {
        let repeat = vec![message(1, 5)];
        let mut source = ScriptedSource::new(vec![
            page(repeat.clone(), Some("a")),
            page(repeat.clone(), Some("b")),
            page(repeat.clone(), Some("c")),
            page(repeat, Some("d")),
        ]);
        let stop = StopPolicy {
            empty_page_limit: Some(2),
            ..StopPolicy::default()
        };
        let harvest = collector()
            .collect(&mut source, &stop, &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::EmptyPages);
        assert_eq!(harvest.records.len(), 1);
    }

    #[tokio::test]
    async fn test_record_limit_stops() {
        let mut source = ScriptedSource::new(vec![
            page(vec![message(1, 5), message(2, 5)], Some("a")),
            page(vec![message(3, 5), message(4, 5)], Some("b")),
        ]);
        let stop = StopPolicy {
            record_limit: Some(2),
            ..StopPolicy::default()
        };
        let harvest = collector()
            .collect(&mut source, &stop, &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::RecordLimit);
        assert_eq!(harvest.records.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_checked_between_pages() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source: ScriptedSource<Message> =
            ScriptedSource::new(vec![page(vec![message(1, 5)], Some("a"))]);
        let harvest = collector()
            .collect(&mut source, &StopPolicy::default(), &cancel)
            .await;

        assert_eq!(harvest.termination, Termination::Cancelled);
        assert_eq!(source.calls, 0);
    }

    #[tokio::test]
    async fn test_recency_cutoff_stops_list_collection() {
        let now = Utc::now();
        let recent = Conversation {
            id: 1,
            updated_at: now.to_rfc3339(),
            ..sparse_conversation(1)
        };
        let old = Conversation {
            id: 2,
            updated_at: (now - ChronoDuration::days(90)).to_rfc3339(),
            ..sparse_conversation(2)
        };

        let mut source = ScriptedSource::new(vec![
            page(vec![recent], Some("a")),
            page(vec![old], Some("b")),
            page(vec![sparse_conversation(3)], None),
        ]);
        let stop = StopPolicy {
            cutoff: Some(now - ChronoDuration::days(30)),
            ..StopPolicy::default()
        };
        let harvest = collector()
            .collect(&mut source, &stop, &CancellationToken::new())
            .await;

        assert_eq!(harvest.termination, Termination::ReachedCutoff);
        assert_eq!(harvest.records.len(), 2);
        assert_eq!(source.calls, 2);
    }

    pub(crate) fn sparse_conversation(id: i64) -> Conversation {
        Conversation {
            id,
            created_at: String::new(),
            updated_at: String::new(),
            service: Default::default(),
            counterparty: Default::default(),
            price: None,
            hired: false,
            last_message: None,
            unread_count: 0,
            messages_complete: false,
        }
    }
}
