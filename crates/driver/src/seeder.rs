//! Target seeder: creates executions for a state machine's uncovered targets
//!
//! Pages through candidate targets with the same cadence as the fetcher.
//! Targets from one page are created in a background task; until that task
//! resolves they stay in a local set so later pages do not submit them twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, instrument, trace};

use crate::config::SeederConfig;
use crate::fetcher::Cadence;
use crate::store::{RemoteStore, StoreError};

type Creation = (String, Result<String, StoreError>);

/// What one seeding cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedCycle {
    /// Targets returned by the store
    pub found: usize,
    /// Targets handed to a creation task
    pub new: usize,
    pub cadence: Cadence,
    pub wait: Duration,
}

/// Keeps a state machine's targets supplied with executions
pub struct TargetSeeder {
    store: Arc<dyn RemoteStore>,
    config: SeederConfig,
    next_page_delay: Duration,
    empty_cycles_before_cooldown: u32,
    start: usize,
    empty_cycles: u32,
    creating: HashSet<String>,
    tasks: JoinSet<Vec<Creation>>,
    task_targets: HashMap<Id, Vec<String>>,
    created: u64,
    failed: u64,
}

impl TargetSeeder {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        config: SeederConfig,
        next_page_delay: Duration,
        empty_cycles_before_cooldown: u32,
    ) -> Self {
        Self {
            store,
            config,
            next_page_delay,
            empty_cycles_before_cooldown,
            start: 1,
            empty_cycles: 0,
            creating: HashSet::new(),
            tasks: JoinSet::new(),
            task_targets: HashMap::new(),
            created: 0,
            failed: 0,
        }
    }

    /// Run a single cycle without waiting afterwards
    #[instrument(skip(self), fields(state_machine = %self.config.state_machine, start = self.start))]
    pub async fn seed_once(&mut self) -> SeedCycle {
        let targets = match self
            .store
            .find_targets(&self.config.state_machine, self.start, self.config.page_size)
            .await
        {
            Ok(targets) => targets,
            Err(err) => {
                error!(error = %err, "failed to find state machine targets");
                Vec::new()
            }
        };

        let found = targets.len();
        let mut fresh = Vec::new();
        for uri in targets {
            if self.creating.insert(uri.clone()) {
                fresh.push(uri);
            } else {
                trace!(target_uri = %uri, "target already being created");
            }
        }
        let new = fresh.len();
        info!(found, new, "found state machine targets");

        if !fresh.is_empty() {
            self.spawn_creations(fresh);
        }
        self.reap_finished();

        let (cadence, wait) = if found >= self.config.page_size {
            self.start += self.config.page_size;
            self.empty_cycles = 0;
            (Cadence::NextPage, self.next_page_delay)
        } else {
            self.start = 1;
            if new == 0 {
                self.empty_cycles = self.empty_cycles.saturating_add(1);
            } else {
                self.empty_cycles = 0;
            }

            if self.empty_cycles > self.empty_cycles_before_cooldown {
                debug!(empty_cycles = self.empty_cycles, "no new targets, cooling down");
                (Cadence::Cooldown, self.config.cooldown)
            } else {
                (Cadence::Poll, self.config.interval)
            }
        };

        SeedCycle {
            found,
            new,
            cadence,
            wait,
        }
    }

    fn spawn_creations(&mut self, targets: Vec<String>) {
        let store = Arc::clone(&self.store);
        let kind = self.config.state_machine.clone();
        let concurrency = self.config.page_size.max(1);
        let batch = targets.clone();

        info!(count = targets.len(), "creating executions");
        let handle = self.tasks.spawn(async move {
            stream::iter(batch)
                .map(|uri| {
                    let store = Arc::clone(&store);
                    let kind = kind.clone();
                    async move {
                        let result = store.create_work_item(&uri, &kind).await;
                        (uri, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect::<Vec<_>>()
                .await
        });
        self.task_targets.insert(handle.id(), targets);
    }

    /// Apply every creation task that has already finished
    pub fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.apply(joined);
        }
    }

    /// Wait for every outstanding creation task
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.apply(joined);
        }
    }

    fn apply(&mut self, joined: Result<(Id, Vec<Creation>), tokio::task::JoinError>) {
        match joined {
            Ok((id, creations)) => {
                self.task_targets.remove(&id);
                for (uri, result) in creations {
                    self.creating.remove(&uri);
                    match result {
                        Ok(execution) => {
                            self.created += 1;
                            debug!(target_uri = %uri, execution = %execution, "created execution");
                        }
                        Err(err) => {
                            self.failed += 1;
                            error!(target_uri = %uri, error = %err, "failed to create execution");
                        }
                    }
                }
            }
            Err(join_error) => {
                let targets = self.task_targets.remove(&join_error.id()).unwrap_or_default();
                error!(count = targets.len(), error = %join_error, "execution creation task failed");
                self.failed += targets.len() as u64;
                for uri in targets {
                    self.creating.remove(&uri);
                }
            }
        }
    }

    /// Cycle until shutdown, then wait for outstanding creations
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let cycle = self.seed_once().await;

            tokio::select! {
                _ = tokio::time::sleep(cycle.wait) => {}
                _ = shutdown_rx.changed() => {
                    debug!("Seeder loop: shutdown requested");
                    break;
                }
            }
        }

        self.drain().await;
        info!(created = self.created, failed = self.failed, "seeder stopped");
    }

    /// Executions created so far
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Targets whose creation failed so far
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Targets currently being created
    pub fn in_flight(&self) -> usize {
        self.creating.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRemoteStore;

    fn seeder(store: &Arc<InMemoryRemoteStore>, page_size: usize) -> TargetSeeder {
        TargetSeeder::new(
            store.clone(),
            SeederConfig::new("orders").with_page_size(page_size),
            Duration::from_millis(10),
            3,
        )
    }

    #[tokio::test]
    async fn test_creates_one_execution_per_target() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.add_targets("orders", ["/t/1", "/t/2", "/t/3"]);
        let mut seeder = seeder(&store, 10);

        let cycle = seeder.seed_once().await;
        assert_eq!((cycle.found, cycle.new), (3, 3));
        assert_eq!(cycle.cadence, Cadence::Poll);
        seeder.drain().await;

        assert_eq!(seeder.created(), 3);
        assert_eq!(seeder.in_flight(), 0);
        let mut targets: Vec<String> = store.created_items().into_iter().map(|(_, t)| t).collect();
        targets.sort();
        assert_eq!(targets, vec!["/t/1", "/t/2", "/t/3"]);

        // Covered targets are no longer returned
        let cycle = seeder.seed_once().await;
        assert_eq!(cycle.found, 0);
    }

    #[tokio::test]
    async fn test_targets_being_created_are_not_resubmitted() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.add_targets("orders", ["/t/1", "/t/2"]);
        let mut seeder = seeder(&store, 10);

        let first = seeder.seed_once().await;
        assert_eq!(first.new, 2);
        assert_eq!(seeder.in_flight(), 2);

        // Nothing has run yet, so the store still reports both targets
        let second = seeder.seed_once().await;
        assert_eq!((second.found, second.new), (2, 0));

        seeder.drain().await;
        assert_eq!(seeder.created(), 2);
        assert_eq!(store.created_items().len(), 2);
    }

    #[tokio::test]
    async fn test_full_page_requests_next_page() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.add_targets("orders", (1..=5).map(|i| format!("/t/{i}")));
        let mut seeder = seeder(&store, 2);

        let cycle = seeder.seed_once().await;
        assert_eq!(cycle.cadence, Cadence::NextPage);
        assert_eq!(cycle.wait, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_cools_down_without_new_targets() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let mut seeder = seeder(&store, 10);

        for _ in 0..3 {
            assert_eq!(seeder.seed_once().await.cadence, Cadence::Poll);
        }
        let cycle = seeder.seed_once().await;
        assert_eq!(cycle.cadence, Cadence::Cooldown);
        assert_eq!(cycle.wait, SeederConfig::new("orders").cooldown);
    }
}
