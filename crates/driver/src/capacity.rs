//! Capacity controller: sizes the worker pool to the backend's active node count

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::pool::BatchPool;
use crate::store::RemoteStore;

/// Pool size for `nodes` active backend nodes
///
/// `min(max_thread_count, nodes * threads_per_host)`, never below 1.
pub fn scaled_pool_size(nodes: usize, threads_per_host: usize, max_thread_count: usize) -> usize {
    nodes
        .saturating_mul(threads_per_host)
        .min(max_thread_count)
        .max(1)
}

/// Result of one capacity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityCheck {
    Resized { nodes: usize, from: usize, to: usize },
    Unchanged { nodes: usize },
    /// Node count observed, but the pool size is pinned
    Fixed { nodes: usize },
    /// Node count unavailable; pool size kept
    Failed,
}

/// Periodically resizes the pool to match backend capacity
pub struct CapacityController {
    store: Arc<dyn RemoteStore>,
    pool: Arc<BatchPool>,
    threads_per_host: usize,
    max_thread_count: usize,
    fixed: bool,
    last_nodes: Option<usize>,
}

impl CapacityController {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        pool: Arc<BatchPool>,
        threads_per_host: usize,
        max_thread_count: usize,
        fixed: bool,
    ) -> Self {
        Self {
            store,
            pool,
            threads_per_host,
            max_thread_count,
            fixed,
            last_nodes: None,
        }
    }

    /// Query the node count once and resize if needed
    #[instrument(skip(self))]
    pub async fn check_once(&mut self) -> CapacityCheck {
        let nodes = match self.store.active_node_count().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, pool_size = self.pool.max_size(), "failed to query active nodes");
                return CapacityCheck::Failed;
            }
        };

        let changed = self.last_nodes != Some(nodes);
        self.last_nodes = Some(nodes);

        if self.fixed {
            if changed {
                info!(
                    nodes,
                    pool_size = self.pool.max_size(),
                    "active node count changed, pool size is fixed"
                );
            }
            return CapacityCheck::Fixed { nodes };
        }

        let target = scaled_pool_size(nodes, self.threads_per_host, self.max_thread_count);
        let current = self.pool.max_size();
        if target == current {
            debug!(nodes, pool_size = current, "pool size unchanged");
            return CapacityCheck::Unchanged { nodes };
        }

        let from = self.pool.resize(target);
        info!(nodes, from, to = target, "scaling worker pool");
        CapacityCheck::Resized {
            nodes,
            from,
            to: target,
        }
    }

    /// Check immediately, then every `interval` until shutdown
    pub async fn run(mut self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown_rx.changed() => {
                    debug!("Capacity loop: shutdown requested");
                    break;
                }
            }
        }
    }
}
