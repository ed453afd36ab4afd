//! Bounded worker pool for per-conversation collection
//!
//! One task per conversation id, at most `concurrency` running at a time.
//! Every input id comes back with exactly one terminal outcome, in input
//! order; one conversation's failure never touches the others.
//! Cancellation stops dispatching queued ids, while in-flight tasks
//! finish their current page and report partial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collector::{Collector, Harvest};
use crate::model::{Message, TaskOutcome, TaskStatus, Termination};
use crate::pacing::StopPolicy;
use crate::source::PageSource;

/// One conversation's collection result.
#[derive(Debug)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub messages: Vec<Message>,
}

impl TaskResult {
    fn bare(conversation_id: i64, status: TaskStatus, error: Option<String>) -> Self {
        Self {
            outcome: TaskOutcome {
                conversation_id,
                status,
                message_count: 0,
                pages: 0,
                termination: None,
                duration_secs: 0.0,
                error,
            },
            messages: Vec::new(),
        }
    }

    fn skipped(conversation_id: i64) -> Self {
        Self::bare(conversation_id, TaskStatus::Skipped, None)
    }

    fn cancelled(conversation_id: i64) -> Self {
        Self::bare(conversation_id, TaskStatus::Cancelled, None)
    }

    fn failed(conversation_id: i64, error: String) -> Self {
        Self::bare(conversation_id, TaskStatus::Failed, Some(error))
    }

    fn from_harvest(
        conversation_id: i64,
        harvest: Harvest<Message>,
        duration_secs: f64,
    ) -> Self {
        let had_fatal = harvest.failures.iter().any(|f| f.fatal);
        let status = match harvest.termination {
            Termination::Exhausted
            | Termination::EmptyPages
            | Termination::PageLimit
            | Termination::RecordLimit
            | Termination::ReachedCutoff => TaskStatus::Success,
            Termination::Deadline | Termination::Cancelled => TaskStatus::Partial,
            // Retries exhausted still count as partial; only a fatal
            // error with nothing to show is a failure.
            Termination::Aborted => {
                if had_fatal && harvest.records.is_empty() {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Partial
                }
            }
        };
        let error = harvest.failures.last().map(|f| f.error.clone());

        Self {
            outcome: TaskOutcome {
                conversation_id,
                status,
                message_count: harvest.records.len(),
                pages: harvest.pages,
                termination: Some(harvest.termination),
                duration_secs,
                error,
            },
            messages: harvest.records,
        }
    }
}

pub struct WorkerPool {
    collector: Arc<Collector>,
    concurrency: usize,
    stop: StopPolicy,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        collector: Arc<Collector>,
        concurrency: usize,
        stop: StopPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collector,
            concurrency: concurrency.max(1),
            stop,
            cancel,
        }
    }

    /// Collect messages for every id. `make_source` builds the per-
    /// conversation page source; `skip` short-circuits ids that are
    /// already fully collected.
    pub async fn run<S, F, K>(
        &self,
        ids: &[i64],
        make_source: F,
        skip: Option<K>,
    ) -> Vec<TaskResult>
    where
        S: PageSource<Record = Message> + 'static,
        F: Fn(i64) -> S + Send + Sync + 'static,
        K: Fn(i64) -> bool,
    {
        let mut results: Vec<Option<TaskResult>> = ids.iter().map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let make_source = Arc::new(make_source);
        let mut pending: HashMap<tokio::task::Id, (usize, i64)> = HashMap::new();
        let mut join_set = JoinSet::new();

        for (index, &id) in ids.iter().enumerate() {
            if self.cancel.is_cancelled() {
                results[index] = Some(TaskResult::cancelled(id));
                continue;
            }
            if let Some(skip) = skip.as_ref() {
                if skip(id) {
                    debug!(conversation_id = id, "already fully collected, skipping");
                    results[index] = Some(TaskResult::skipped(id));
                    continue;
                }
            }

            let semaphore = Arc::clone(&semaphore);
            let collector = Arc::clone(&self.collector);
            let make_source = Arc::clone(&make_source);
            let stop = self.stop.clone();
            let cancel = self.cancel.clone();

            let handle = join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return TaskResult::cancelled(id),
                };
                if cancel.is_cancelled() {
                    return TaskResult::cancelled(id);
                }

                let started = Instant::now();
                let mut source = make_source(id);
                let harvest = collector.collect(&mut source, &stop, &cancel).await;
                TaskResult::from_harvest(id, harvest, started.elapsed().as_secs_f64())
            });
            pending.insert(handle.id(), (index, id));
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((task_id, result)) => {
                    if let Some((index, id)) = pending.remove(&task_id) {
                        debug!(
                            conversation_id = id,
                            status = result.outcome.status.as_str(),
                            messages = result.outcome.message_count,
                            "task finished"
                        );
                        results[index] = Some(result);
                    }
                }
                Err(join_error) => {
                    if let Some((index, id)) = pending.remove(&join_error.id()) {
                        warn!(conversation_id = id, error = %join_error, "collection task panicked");
                        results[index] = Some(TaskResult::failed(id, join_error.to_string()));
                    }
                }
            }
        }

        results
            .into_iter()
            .zip(ids)
            .map(|(result, &id)| {
                result.unwrap_or_else(|| {
                    TaskResult::failed(id, "task produced no result".to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::collector::tests::message;
    use crate::config::PacingConfig;
    use crate::pacing::Pacer;
    use crate::source::{FetchError, Page};

    /// Serves `pages` pages of two messages each, unless the id is in the
    /// failing set, in which case every fetch times out.
    struct FakeSource {
        conversation_id: i64,
        pages: u32,
        served: u32,
        fail: bool,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageSource for FakeSource {
        type Record = Message;

        async fn next_page(&mut self, _cursor: Option<&str>) -> Result<Page<Message>, FetchError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(FetchError::Retryable("connect timeout".to_string()));
            }

            self.served += 1;
            let base = self.conversation_id * 1_000 + i64::from(self.served) * 10;
            let next = (self.served < self.pages).then(|| self.served.to_string());
            Ok(Page {
                records: vec![
                    message(base, self.conversation_id),
                    message(base + 1, self.conversation_id),
                ],
                next_cursor: next,
            })
        }
    }

    fn pool_with(concurrency: usize) -> (WorkerPool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let collector = Arc::new(Collector::new(
            Arc::new(Pacer::new(PacingConfig::immediate())),
            1,
        ));
        let pool = WorkerPool::new(
            collector,
            concurrency,
            StopPolicy::default(),
            CancellationToken::new(),
        );
        (pool, Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn test_every_id_yields_one_outcome() {
        let (pool, in_flight, max_in_flight) = pool_with(2);
        let ids = vec![1, 2, 3, 4, 5];

        let failing = 3;
        let results = pool
            .run(
                &ids,
                move |id| FakeSource {
                    conversation_id: id,
                    pages: 2,
                    served: 0,
                    fail: id == failing,
                    in_flight: Arc::clone(&in_flight),
                    max_in_flight: Arc::clone(&max_in_flight),
                },
                None::<fn(i64) -> bool>,
            )
            .await;

        assert_eq!(results.len(), 5);
        for (result, &id) in results.iter().zip(&ids) {
            assert_eq!(result.outcome.conversation_id, id);
        }

        let succeeded = results
            .iter()
            .filter(|r| r.outcome.status == TaskStatus::Success)
            .count();
        let partial: Vec<_> = results
            .iter()
            .filter(|r| r.outcome.status == TaskStatus::Partial)
            .collect();
        assert_eq!(succeeded, 4);
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].outcome.conversation_id, 3);

        // The healthy conversations kept all their messages
        for result in &results {
            if result.outcome.status == TaskStatus::Success {
                assert_eq!(result.messages.len(), 4);
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (pool, in_flight, max_in_flight) = pool_with(2);
        let max_seen = Arc::clone(&max_in_flight);
        let ids: Vec<i64> = (1..=6).collect();

        pool.run(
            &ids,
            move |id| FakeSource {
                conversation_id: id,
                pages: 3,
                served: 0,
                fail: false,
                in_flight: Arc::clone(&in_flight),
                max_in_flight: Arc::clone(&max_in_flight),
            },
            None::<fn(i64) -> bool>,
        )
        .await;

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_skip_predicate_reports_skipped() {
        let (pool, in_flight, max_in_flight) = pool_with(1);
        let ids = vec![1, 2, 3];

        let results = pool
            .run(
                &ids,
                move |id| FakeSource {
                    conversation_id: id,
                    pages: 1,
                    served: 0,
                    fail: false,
                    in_flight: Arc::clone(&in_flight),
                    max_in_flight: Arc::clone(&max_in_flight),
                },
                Some(|id: i64| id == 2),
            )
            .await;

        assert_eq!(results[1].outcome.status, TaskStatus::Skipped);
        assert_eq!(results[1].messages.len(), 0);
        assert_eq!(results[0].outcome.status, TaskStatus::Success);
        assert_eq!(results[2].outcome.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_deadline_marks_partial_and_keeps_pages() {
        let collector = Arc::new(Collector::new(
            Arc::new(Pacer::new(PacingConfig::immediate())),
            1,
        ));
        let stop = StopPolicy {
            // Trips after the first page's 5 ms sleep
            deadline: Some(Duration::from_millis(1)),
            ..StopPolicy::default()
        };
        let pool = WorkerPool::new(collector, 1, stop, CancellationToken::new());

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let results = pool
            .run(
                &[7],
                move |id| FakeSource {
                    conversation_id: id,
                    pages: 100,
                    served: 0,
                    fail: false,
                    in_flight: Arc::clone(&in_flight),
                    max_in_flight: Arc::clone(&max_in_flight),
                },
                None::<fn(i64) -> bool>,
            )
            .await;

        assert_eq!(results[0].outcome.status, TaskStatus::Partial);
        assert_eq!(results[0].outcome.termination, Some(Termination::Deadline));
        // Whatever was fetched before the deadline stays collected
        assert_eq!(results[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_pre_cancelled_pool_reports_cancelled() {
        let collector = Arc::new(Collector::new(
            Arc::new(Pacer::new(PacingConfig::immediate())),
            1,
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = WorkerPool::new(collector, 2, StopPolicy::default(), cancel);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let results = pool
            .run(
                &[1, 2],
                move |id| FakeSource {
                    conversation_id: id,
                    pages: 1,
                    served: 0,
                    fail: false,
                    in_flight: Arc::clone(&in_flight),
                    max_in_flight: Arc::clone(&max_in_flight),
                },
                None::<fn(i64) -> bool>,
            )
            .await;

        assert!(results
            .iter()
            .all(|r| r.outcome.status == TaskStatus::Cancelled));
    }
}
