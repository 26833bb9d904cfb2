//! Throughput counters and the periodic metrics report

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::pool::BatchPool;
use crate::registry::WorkQueue;

/// Process-wide totals, incremented concurrently by reaping and read by reporting
#[derive(Debug, Default)]
pub struct DriverCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    abandoned: AtomicU64,
    batches: AtomicU64,
}

impl DriverCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_errors(&self, count: u64) {
        self.errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    /// Allocate the next batch id (starts at 1)
    pub fn next_batch_id(&self) -> u64 {
        self.batches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Batches submitted so far, retries included
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

/// One metrics report
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub abandoned: u64,
    /// Processed per second since the previous report
    pub rate: f64,
    pub queued_batches: usize,
    pub in_flight_batches: usize,
    pub registry_size: usize,
    pub pool_size: usize,
    pub taken_at: DateTime<Utc>,
}

/// Periodically logs totals and throughput
pub struct MetricsReporter {
    counters: Arc<DriverCounters>,
    queue: Arc<WorkQueue>,
    pool: Arc<BatchPool>,
    interval: Duration,
    previous: u64,
}

impl MetricsReporter {
    pub fn new(
        counters: Arc<DriverCounters>,
        queue: Arc<WorkQueue>,
        pool: Arc<BatchPool>,
        interval: Duration,
    ) -> Self {
        Self {
            counters,
            queue,
            pool,
            interval,
            previous: 0,
        }
    }

    /// Compute and log one report
    pub fn report(&mut self) -> MetricsSnapshot {
        let processed = self.counters.processed();
        let delta = processed.saturating_sub(self.previous);
        let seconds = self.interval.as_secs_f64();
        let rate = if seconds > 0.0 {
            delta as f64 / seconds
        } else {
            0.0
        };
        self.previous = processed;

        let snapshot = MetricsSnapshot {
            processed,
            errors: self.counters.errors(),
            abandoned: self.counters.abandoned(),
            rate,
            queued_batches: self.pool.queued(),
            in_flight_batches: self.pool.in_flight(),
            registry_size: self.queue.in_progress(),
            pool_size: self.pool.max_size(),
            taken_at: Utc::now(),
        };

        info!(
            processed = snapshot.processed,
            errors = snapshot.errors,
            abandoned = snapshot.abandoned,
            rate = snapshot.rate,
            "Processed {} transitions with {} errors, current rate {:.2} transitions/second",
            snapshot.processed,
            snapshot.errors,
            snapshot.rate
        );
        debug!(
            queued_batches = snapshot.queued_batches,
            in_flight_batches = snapshot.in_flight_batches,
            registry_size = snapshot.registry_size,
            pool_size = snapshot.pool_size,
            "queue depth"
        );

        snapshot
    }

    /// Report every `interval` until shutdown, then hand the reporter back
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Self {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report();
                }
                _ = shutdown_rx.changed() => {
                    debug!("Metrics loop: shutdown requested");
                    break;
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ids_are_monotonic() {
        let counters = DriverCounters::new();
        assert_eq!(counters.next_batch_id(), 1);
        assert_eq!(counters.next_batch_id(), 2);
        assert_eq!(counters.batches(), 2);
    }

    #[tokio::test]
    async fn test_rate_uses_delta_since_previous_report() {
        let counters = Arc::new(DriverCounters::new());
        let queue = Arc::new(WorkQueue::new());
        let pool = Arc::new(BatchPool::new(4));
        let mut reporter = MetricsReporter::new(
            counters.clone(),
            queue,
            pool,
            Duration::from_secs(5),
        );

        counters.add_processed(50);
        counters.add_errors(2);
        let first = reporter.report();
        assert_eq!(first.processed, 50);
        assert_eq!(first.errors, 2);
        assert_eq!(first.rate, 10.0);
        assert_eq!(first.pool_size, 4);

        counters.add_processed(25);
        let second = reporter.report();
        assert_eq!(second.processed, 75);
        assert_eq!(second.rate, 5.0);

        // Reporting never changes the counters
        assert_eq!(counters.processed(), 75);
        assert_eq!(counters.errors(), 2);
    }
}
