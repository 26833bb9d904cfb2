//! Dispatcher: turns buffered identifiers into pool submissions and reaps results
//!
//! Each tick drains the intake buffer, submits pending retries as singleton
//! batches ahead of new batches, then waits up to one tick interval for
//! results. Results arrive on a channel fed by the pool jobs, so reaping never
//! polls individual tasks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::{assemble_batches, BatchOutcome, Submission, SubmissionKind};
use crate::metrics::DriverCounters;
use crate::pool::{BatchPool, PoolError};
use crate::registry::WorkQueue;
use crate::retry::{Classification, RetryManager, RetryPolicy};
use crate::store::{RemoteStore, StoreError};

/// Bookkeeping for a submission that has not resolved yet
#[derive(Debug)]
struct PendingBatch {
    size: usize,
    kind: SubmissionKind,
    submitted_at: Instant,
}

/// Submissions made by one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub retries: usize,
    pub batches: usize,
}

/// Outcomes applied by one reap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Submissions whose call returned
    pub completed: usize,
    /// Identifiers queued for a retry
    pub retried: usize,
    /// Identifiers given up on
    pub abandoned: usize,
}

impl ReapReport {
    fn absorb(&mut self, classification: &Classification) {
        match classification {
            Classification::Completed { .. } => self.completed += 1,
            Classification::Retry(units) => self.retried += units.len(),
            Classification::Abandoned(_) => self.abandoned += 1,
        }
    }

    fn merge(&mut self, other: ReapReport) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
    }
}

/// Batches work onto the pool and applies results
pub struct Dispatcher {
    store: Arc<dyn RemoteStore>,
    queue: Arc<WorkQueue>,
    pool: Arc<BatchPool>,
    counters: Arc<DriverCounters>,
    retries: RetryManager,
    batch_size: usize,
    results_tx: mpsc::UnboundedSender<BatchOutcome>,
    results_rx: mpsc::UnboundedReceiver<BatchOutcome>,
    pending: HashMap<u64, PendingBatch>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        queue: Arc<WorkQueue>,
        pool: Arc<BatchPool>,
        counters: Arc<DriverCounters>,
        batch_size: usize,
        retry_count: u32,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let retries = RetryManager::new(
            RetryPolicy::new(retry_count),
            Arc::clone(&queue),
            Arc::clone(&counters),
        );
        Self {
            store,
            queue,
            pool,
            counters,
            retries,
            batch_size,
            results_tx,
            results_rx,
            pending: HashMap::new(),
        }
    }

    /// Submit pending retries, then batches built from the intake buffer
    pub fn dispatch(&mut self) -> DispatchReport {
        let mut report = DispatchReport::default();

        for unit in self.retries.take_pending() {
            if !self.queue.is_current(&unit.id, unit.generation) {
                // Expired and fetched again; the newer registration owns it now
                debug!(
                    execution = %unit.id,
                    attempts = unit.attempts,
                    "dropping retry for superseded registration"
                );
                continue;
            }
            let submission = Submission::retry(self.counters.next_batch_id(), unit);
            if self.submit(submission).is_err() {
                return report;
            }
            report.retries += 1;
        }

        let drained = self.queue.drain();
        if drained.is_empty() {
            return report;
        }

        let counters = Arc::clone(&self.counters);
        for submission in assemble_batches(drained, self.batch_size, || counters.next_batch_id()) {
            if self.submit(submission).is_err() {
                return report;
            }
            report.batches += 1;
        }

        report
    }

    fn submit(&mut self, submission: Submission) -> Result<(), PoolError> {
        let batch_id = submission.batch_id;
        let size = submission.len();
        let kind = submission.kind;
        let store = Arc::clone(&self.store);
        let results_tx = self.results_tx.clone();

        let job = async move {
            debug!(batch_id, size, "processing batch");
            let result = AssertUnwindSafe(store.process_batch(&submission.items))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(StoreError::Transport(format!(
                        "batch task panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            // The receiver only goes away once the driver has stopped reaping
            let _ = results_tx.send(BatchOutcome { submission, result });
        };

        match self.pool.spawn(job) {
            Ok(()) => {
                self.pending.insert(
                    batch_id,
                    PendingBatch {
                        size,
                        kind,
                        submitted_at: Instant::now(),
                    },
                );
                Ok(())
            }
            Err(err) => {
                // Identifiers stay registered and age out through expiry
                warn!(batch_id, size, error = %err, "could not submit batch");
                Err(err)
            }
        }
    }

    /// Apply every result that is already available
    pub fn reap_ready(&mut self) -> ReapReport {
        let mut report = ReapReport::default();
        while let Ok(outcome) = self.results_rx.try_recv() {
            report.absorb(&self.handle(outcome));
        }
        report
    }

    /// Wait up to `timeout` for a result, then apply everything available
    pub async fn reap_for(&mut self, timeout: Duration) -> ReapReport {
        let mut report = ReapReport::default();
        if let Ok(Some(outcome)) = tokio::time::timeout(timeout, self.results_rx.recv()).await {
            report.absorb(&self.handle(outcome));
        }
        report.merge(self.reap_ready());
        report
    }

    /// Wait for every submitted job to finish and apply its result
    ///
    /// The pool must already be closed, otherwise this waits for jobs that
    /// are still being submitted elsewhere.
    pub async fn drain(&mut self) -> ReapReport {
        let mut report = ReapReport::default();
        let pool = Arc::clone(&self.pool);
        let finished = pool.wait();
        tokio::pin!(finished);

        loop {
            tokio::select! {
                _ = &mut finished => break,
                Some(outcome) = self.results_rx.recv() => {
                    report.absorb(&self.handle(outcome));
                }
            }
        }
        report.merge(self.reap_ready());

        if !self.pending.is_empty() {
            warn!(unresolved = self.pending.len(), "batches left unresolved after drain");
        }
        let retries = self.retries.pending();
        if retries > 0 {
            info!(retries, "dropping queued retries on shutdown");
        }
        report
    }

    /// Run ticks until shutdown is signalled
    pub async fn run(&mut self, tick: Duration, shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                debug!("Dispatcher loop: shutdown requested");
                break;
            }
            self.dispatch();
            self.reap_for(tick).await;
        }
    }

    fn handle(&mut self, outcome: BatchOutcome) -> Classification {
        let batch_id = outcome.submission.batch_id;
        match self.pending.remove(&batch_id) {
            Some(pending) => debug!(
                batch_id,
                size = pending.size,
                retry = matches!(pending.kind, SubmissionKind::Retry { .. }),
                elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                "batch resolved"
            ),
            None => error!(batch_id, "result for unknown batch"),
        }
        self.retries.reap(outcome)
    }

    /// Submissions not yet resolved
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Retry units waiting for the next dispatch
    pub fn pending_retries(&self) -> usize {
        self.retries.pending()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CandidateQuery, InMemoryRemoteStore, ItemResult};
    use async_trait::async_trait;

    struct Harness {
        store: Arc<InMemoryRemoteStore>,
        queue: Arc<WorkQueue>,
        counters: Arc<DriverCounters>,
        dispatcher: Dispatcher,
    }

    fn harness(pool_size: usize, batch_size: usize) -> Harness {
        let store = Arc::new(InMemoryRemoteStore::new());
        let queue = Arc::new(WorkQueue::new());
        let counters = Arc::new(DriverCounters::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            Arc::new(BatchPool::new(pool_size)),
            counters.clone(),
            batch_size,
            3,
        );
        Harness {
            store,
            queue,
            counters,
            dispatcher,
        }
    }

    async fn settle(dispatcher: &mut Dispatcher) {
        while dispatcher.pending() > 0 {
            dispatcher.reap_for(Duration::from_millis(10)).await;
        }
    }

    fn ids(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("/e/{i}")).collect()
    }

    #[tokio::test]
    async fn test_dispatch_batches_and_releases_completed() {
        let mut h = harness(4, 5);
        h.store.add_items(ids(12));
        h.queue.intake(ids(12), Instant::now());

        let report = h.dispatcher.dispatch();
        assert_eq!(report, DispatchReport { retries: 0, batches: 3 });
        settle(&mut h.dispatcher).await;

        let mut sizes: Vec<usize> = h.store.process_calls().iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 5, 5]);
        assert_eq!(h.counters.processed(), 12);
        assert_eq!(h.queue.in_progress(), 0);
    }

    #[tokio::test]
    async fn test_retries_go_out_before_new_batches() {
        let mut h = harness(1, 5);
        h.store.add_items(["a", "b", "c"]);
        h.store.fail_calls_containing("a");

        h.queue.intake(vec!["a".to_string()], Instant::now());
        h.dispatcher.dispatch();
        settle(&mut h.dispatcher).await;
        assert_eq!(h.dispatcher.pending_retries(), 1);
        assert_eq!(h.counters.errors(), 1);

        h.store.clear_call_failure("a");
        h.queue.intake(vec!["b".to_string(), "c".to_string()], Instant::now());
        let report = h.dispatcher.dispatch();
        assert_eq!(report, DispatchReport { retries: 1, batches: 1 });
        settle(&mut h.dispatcher).await;

        assert_eq!(
            h.store.process_calls(),
            vec![
                vec!["a".to_string()],
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
            ]
        );
        assert_eq!(h.counters.processed(), 3);
        assert_eq!(h.queue.in_progress(), 0);
    }

    /// Store whose processing call panics
    struct PanickingStore;

    #[async_trait]
    impl RemoteStore for PanickingStore {
        async fn fetch_candidates(&self, _query: &CandidateQuery) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }

        async fn process_batch(&self, _ids: &[String]) -> Result<Vec<ItemResult>, StoreError> {
            panic!("decoder blew up");
        }

        async fn create_work_item(&self, _target: &str, _kind: &str) -> Result<String, StoreError> {
            Err(StoreError::Rejected("unsupported".into()))
        }

        async fn active_node_count(&self) -> Result<usize, StoreError> {
            Ok(1)
        }

        async fn find_targets(
            &self,
            _kind: &str,
            _start: usize,
            _count: usize,
        ) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_panicking_batch_is_a_call_failure() {
        let queue = Arc::new(WorkQueue::new());
        let counters = Arc::new(DriverCounters::new());
        let mut dispatcher = Dispatcher::new(
            Arc::new(PanickingStore),
            queue.clone(),
            Arc::new(BatchPool::new(2)),
            counters.clone(),
            5,
            3,
        );

        queue.intake(vec!["x".to_string(), "y".to_string()], Instant::now());
        dispatcher.dispatch();
        settle(&mut dispatcher).await;

        assert_eq!(dispatcher.pending_retries(), 2);
        assert_eq!(counters.errors(), 2);
        assert!(queue.is_registered("x"));
    }

    #[tokio::test]
    async fn test_drain_applies_in_flight_results() {
        let mut h = harness(2, 2);
        h.store.add_items(ids(6));
        h.store.set_latency(Duration::from_millis(20));
        h.queue.intake(ids(6), Instant::now());

        h.dispatcher.dispatch();
        h.dispatcher.pool.close();
        let report = h.dispatcher.drain().await;

        assert_eq!(report.completed, 3);
        assert_eq!(h.dispatcher.pending(), 0);
        assert_eq!(h.counters.processed(), 6);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_retry_dropped_once_registration_superseded() {
        let mut h = harness(1, 5);
        h.store.add_items(["x"]);
        h.store.fail_calls_containing("x");
        let start = Instant::now();

        h.queue.intake(vec!["x".to_string()], start);
        h.dispatcher.dispatch();
        settle(&mut h.dispatcher).await;
        assert_eq!(h.dispatcher.pending_retries(), 1);

        h.queue.purge_expired(Duration::from_secs(60), start + Duration::from_secs(61));
        h.queue.intake(vec!["x".to_string()], start + Duration::from_secs(61));
        h.store.clear_call_failure("x");

        let report = h.dispatcher.dispatch();
        assert_eq!(report, DispatchReport { retries: 0, batches: 1 });
        settle(&mut h.dispatcher).await;
        assert_eq!(h.store.process_calls().len(), 2);
        assert_eq!(h.queue.in_progress(), 0);
    }
}
