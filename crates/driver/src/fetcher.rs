//! Fetcher: pages candidate identifiers from the store into the work queue
//!
//! Each cycle first ages out stale registry entries, then either backs off
//! (registry at its threshold) or requests one page. A full page means more
//! work is waiting, so the next page follows after a short delay. Anything
//! else, backpressure included, restarts from the first page and waits the
//! poll interval, or the cooldown after several partial pages that produced
//! nothing new.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::config::DriverConfig;
use crate::registry::WorkQueue;
use crate::store::{CandidateQuery, RemoteStore};

/// Why the fetcher waits before its next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// The last page was full; request the next one
    NextPage,
    /// Partial page; poll again from the start
    Poll,
    /// Too many consecutive cycles without new identifiers
    Cooldown,
    /// Registry at its threshold; nothing was fetched
    Backpressure,
}

/// What one fetch cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCycle {
    pub fetched: usize,
    pub new: usize,
    pub purged: usize,
    pub cadence: Cadence,
    pub wait: Duration,
}

/// Pulls candidate identifiers and feeds them to the work queue
pub struct Fetcher {
    store: Arc<dyn RemoteStore>,
    queue: Arc<WorkQueue>,
    config: DriverConfig,
    status: Vec<String>,
    /// 1-based cursor of the next page
    start: usize,
    empty_cycles: u32,
}

impl Fetcher {
    pub fn new(store: Arc<dyn RemoteStore>, queue: Arc<WorkQueue>, config: DriverConfig) -> Self {
        let status = config.status_filter();
        Self {
            store,
            queue,
            config,
            status,
            start: 1,
            empty_cycles: 0,
        }
    }

    /// Run a single cycle without waiting afterwards
    #[instrument(skip(self), fields(start = self.start))]
    pub async fn fetch_once(&mut self) -> FetchCycle {
        let purged = self
            .queue
            .purge_expired(self.config.expiry_threshold, Instant::now())
            .len();

        let in_progress = self.queue.in_progress();
        if in_progress >= self.config.queue_threshold {
            info!(
                in_progress,
                threshold = self.config.queue_threshold,
                "Queued executions limit reached"
            );
            self.start = 1;
            return FetchCycle {
                fetched: 0,
                new: 0,
                purged,
                cadence: Cadence::Backpressure,
                wait: self.config.poll_interval,
            };
        }

        let query = CandidateQuery {
            start: self.start,
            count: self.config.poll_size,
            names: self.config.names.clone(),
            status: self.status.clone(),
        };
        debug!(start = query.start, count = query.count, "requesting candidates");

        let ids = match self.store.fetch_candidates(&query).await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, start = self.start, "failed to fetch candidates");
                Vec::new()
            }
        };

        let fetched = ids.len();
        let intake = self.queue.intake(ids, Instant::now());
        if fetched > 0 {
            info!(fetched, new = intake.new, "fetched executions");
        }

        let (cadence, wait) = if fetched >= self.config.poll_size {
            self.start += self.config.poll_size;
            self.empty_cycles = 0;
            (Cadence::NextPage, self.config.next_page_delay)
        } else {
            self.start = 1;
            if intake.new == 0 {
                self.empty_cycles = self.empty_cycles.saturating_add(1);
            } else {
                self.empty_cycles = 0;
            }

            if self.empty_cycles > self.config.empty_cycles_before_cooldown {
                debug!(empty_cycles = self.empty_cycles, "no new work, cooling down");
                (Cadence::Cooldown, self.config.cooldown)
            } else {
                (Cadence::Poll, self.config.poll_interval)
            }
        };

        FetchCycle {
            fetched,
            new: intake.new,
            purged,
            cadence,
            wait,
        }
    }

    /// Cycle until shutdown; waits are cut short by the shutdown signal
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let cycle = self.fetch_once().await;

            tokio::select! {
                _ = tokio::time::sleep(cycle.wait) => {}
                _ = shutdown_rx.changed() => {
                    debug!("Fetcher loop: shutdown requested");
                    break;
                }
            }
        }
    }

    /// 1-based cursor of the next page
    pub fn cursor(&self) -> usize {
        self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRemoteStore;

    fn setup(config: DriverConfig) -> (Arc<InMemoryRemoteStore>, Arc<WorkQueue>, Fetcher) {
        let store = Arc::new(InMemoryRemoteStore::new());
        let queue = Arc::new(WorkQueue::new());
        let fetcher = Fetcher::new(store.clone(), queue.clone(), config);
        (store, queue, fetcher)
    }

    fn drained_ids(queue: &WorkQueue) -> Vec<String> {
        queue.drain().into_iter().map(|claim| claim.id).collect()
    }

    #[tokio::test]
    async fn test_full_page_advances_cursor() {
        let config = DriverConfig::default().with_poll_size(2);
        let (store, queue, mut fetcher) = setup(config.clone());
        store.add_items(["a", "b", "c"]);

        let first = fetcher.fetch_once().await;
        assert_eq!(first.cadence, Cadence::NextPage);
        assert_eq!(first.wait, config.next_page_delay);
        assert_eq!(first.new, 2);
        assert_eq!(fetcher.cursor(), 3);

        let second = fetcher.fetch_once().await;
        assert_eq!(second.cadence, Cadence::Poll);
        assert_eq!(second.fetched, 1);
        assert_eq!(fetcher.cursor(), 1);
        assert_eq!(drained_ids(&queue), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cooldown_after_repeated_empty_cycles() {
        let config = DriverConfig::default().with_empty_cycles_before_cooldown(3);
        let (store, _queue, mut fetcher) = setup(config.clone());

        for _ in 0..3 {
            assert_eq!(fetcher.fetch_once().await.cadence, Cadence::Poll);
        }
        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.cadence, Cadence::Cooldown);
        assert_eq!(cycle.wait, config.cooldown);

        store.add_item("late");
        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.new, 1);
        assert_eq!(cycle.cadence, Cadence::Poll);
    }

    #[tokio::test]
    async fn test_already_registered_ids_count_as_empty() {
        let config = DriverConfig::default().with_empty_cycles_before_cooldown(1);
        let (store, queue, mut fetcher) = setup(config);
        store.add_item("a");

        assert_eq!(fetcher.fetch_once().await.new, 1);
        assert_eq!(drained_ids(&queue), vec!["a"]);

        // Still a candidate remotely, but in progress locally
        let cycle = fetcher.fetch_once().await;
        assert_eq!((cycle.fetched, cycle.new), (1, 0));
        assert!(queue.drain().is_empty());
        assert_eq!(fetcher.fetch_once().await.cadence, Cadence::Cooldown);
    }

    #[tokio::test]
    async fn test_backpressure_skips_fetch() {
        let config = DriverConfig::default().with_queue_threshold(2);
        let (store, queue, mut fetcher) = setup(config);
        store.add_items(["a", "b", "c"]);
        queue.intake(vec!["x".to_string(), "y".to_string()], Instant::now());

        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.cadence, Cadence::Backpressure);
        assert_eq!(store.fetch_calls(), 0);

        queue.release("x");
        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.new, 3);
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_full_page_resets_empty_cycles() {
        let config = DriverConfig::default()
            .with_poll_size(2)
            .with_empty_cycles_before_cooldown(1);
        let (store, _queue, mut fetcher) = setup(config);
        store.add_items(["a", "b"]);

        assert_eq!(fetcher.fetch_once().await.cadence, Cadence::NextPage);
        assert_eq!(fetcher.fetch_once().await.cadence, Cadence::Poll);

        // Full page of ids already in progress
        let cycle = fetcher.fetch_once().await;
        assert_eq!((cycle.fetched, cycle.new), (2, 0));
        assert_eq!(cycle.cadence, Cadence::NextPage);

        // One partial page since the reset, not two
        assert_eq!(fetcher.fetch_once().await.cadence, Cadence::Poll);
    }

    #[tokio::test]
    async fn test_backpressure_restarts_from_first_page() {
        let config = DriverConfig::default()
            .with_poll_size(2)
            .with_queue_threshold(4);
        let (store, queue, mut fetcher) = setup(config);
        store.add_items(["a", "b", "c", "d", "e"]);

        fetcher.fetch_once().await;
        fetcher.fetch_once().await;
        assert_eq!(fetcher.cursor(), 5);

        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.cadence, Cadence::Backpressure);
        assert_eq!(fetcher.cursor(), 1);

        queue.drain();
        queue.release("a");
        let cycle = fetcher.fetch_once().await;
        assert_eq!((cycle.fetched, cycle.new), (2, 1));
        assert_eq!(drained_ids(&queue), vec!["a"]);
    }

    #[tokio::test]
    async fn test_fetch_error_is_an_empty_cycle() {
        let (store, queue, mut fetcher) = setup(DriverConfig::default());
        store.add_item("a");
        store.set_fetch_failure(true);

        let cycle = fetcher.fetch_once().await;
        assert_eq!(cycle.fetched, 0);
        assert_eq!(cycle.cadence, Cadence::Poll);
        assert_eq!(queue.in_progress(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_refetched() {
        let config = DriverConfig::default().with_expiry_threshold(Duration::from_secs(60));
        let (store, queue, mut fetcher) = setup(config);
        store.add_item("stuck");

        assert_eq!(fetcher.fetch_once().await.new, 1);
        queue.drain();

        tokio::time::advance(Duration::from_secs(30)).await;
        let cycle = fetcher.fetch_once().await;
        assert_eq!((cycle.purged, cycle.new), (0, 0));

        tokio::time::advance(Duration::from_secs(31)).await;
        let cycle = fetcher.fetch_once().await;
        assert_eq!((cycle.purged, cycle.new), (1, 1));
        assert_eq!(drained_ids(&queue), vec!["stuck"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_store, _queue, fetcher) = setup(DriverConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(fetcher.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("fetcher should stop promptly")
            .unwrap();
    }
}
