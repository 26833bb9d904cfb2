//! Driver: wires the queue, pool and loops together and owns their lifecycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::capacity::CapacityController;
use crate::config::{ConfigError, DriverConfig};
use crate::dispatcher::Dispatcher;
use crate::fetcher::Fetcher;
use crate::metrics::{DriverCounters, MetricsReporter};
use crate::pool::BatchPool;
use crate::registry::WorkQueue;
use crate::seeder::TargetSeeder;
use crate::store::RemoteStore;

/// Driver status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    /// Built but not yet running
    Starting,
    /// Fetching and dispatching
    Running,
    /// Shutdown requested; finishing in-flight batches
    Draining,
    /// Fully stopped
    Stopped,
}

/// Driver errors
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Configuration rejected at construction
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `run` was already called on this driver
    #[error("driver is already running")]
    AlreadyRunning,
}

/// Totals at the end of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverSummary {
    pub processed: u64,
    pub errors: u64,
    pub abandoned: u64,
    pub batches: u64,
}

/// Drives executions from the remote store through a bounded worker pool
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use conductor_driver::{Driver, DriverConfig, InMemoryRemoteStore};
///
/// # async fn example() -> Result<(), conductor_driver::DriverError> {
/// let store = Arc::new(InMemoryRemoteStore::new());
/// let driver = Arc::new(Driver::new(store, DriverConfig::default())?);
///
/// let runner = Arc::clone(&driver);
/// let handle = tokio::spawn(async move { runner.run().await });
///
/// // ... later
/// driver.shutdown();
/// let summary = handle.await.unwrap()?;
/// println!("processed {}", summary.processed);
/// # Ok(())
/// # }
/// ```
pub struct Driver {
    store: Arc<dyn RemoteStore>,
    config: DriverConfig,
    queue: Arc<WorkQueue>,
    counters: Arc<DriverCounters>,
    pool: Arc<BatchPool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<DriverStatus>,
    started: AtomicBool,
}

impl Driver {
    /// Create a driver; fails if the configuration is invalid
    pub fn new(store: Arc<dyn RemoteStore>, config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            store,
            queue: Arc::new(WorkQueue::new()),
            counters: Arc::new(DriverCounters::new()),
            pool: Arc::new(BatchPool::new(config.initial_pool_size())),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(DriverStatus::Starting),
            started: AtomicBool::new(false),
        })
    }

    /// Run until [`shutdown`](Self::shutdown) is called, then drain
    ///
    /// The dispatcher runs on the calling task; the fetcher, capacity,
    /// metrics and seeder loops are spawned. After the shutdown signal the
    /// background loops stop, the pool is closed, every in-flight batch is
    /// awaited and reaped, and a final metrics report is logged.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<DriverSummary, DriverError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }

        info!(
            poll_size = self.config.poll_size,
            batch_size = self.config.batch_size,
            queue_threshold = self.config.queue_threshold,
            pool_size = self.pool.max_size(),
            fixed_pool = self.config.uses_fixed_thread_count(),
            "Starting driver"
        );
        *self.status.write() = DriverStatus::Running;

        let mut loops: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let fetcher = Fetcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.config.clone(),
        );
        loops.push(("fetcher", tokio::spawn(fetcher.run(self.shutdown_rx.clone()))));

        let capacity = CapacityController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            self.config.threads_per_host,
            self.config.max_thread_count,
            self.config.uses_fixed_thread_count(),
        );
        loops.push((
            "capacity",
            tokio::spawn(capacity.run(self.config.capacity_interval, self.shutdown_rx.clone())),
        ));

        if let Some(seeder_config) = self.config.seeder.clone() {
            info!(state_machine = %seeder_config.state_machine, "Starting target seeder");
            let seeder = TargetSeeder::new(
                Arc::clone(&self.store),
                seeder_config,
                self.config.next_page_delay,
                self.config.empty_cycles_before_cooldown,
            );
            loops.push(("seeder", tokio::spawn(seeder.run(self.shutdown_rx.clone()))));
        }

        let reporter = MetricsReporter::new(
            Arc::clone(&self.counters),
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            self.config.metrics_interval,
        );
        let metrics = tokio::spawn(reporter.run(self.shutdown_rx.clone()));

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            Arc::clone(&self.counters),
            self.config.batch_size,
            self.config.retry_count,
        );
        dispatcher
            .run(self.config.tick_interval, self.shutdown_rx.clone())
            .await;

        *self.status.write() = DriverStatus::Draining;
        info!(
            in_flight = self.pool.in_flight(),
            queued = self.pool.queued(),
            "Draining in-flight batches"
        );

        for (name, handle) in loops {
            if let Err(err) = handle.await {
                error!(task = name, error = %err, "background loop ended abnormally");
            }
        }

        self.pool.close();
        dispatcher.drain().await;

        match metrics.await {
            Ok(mut reporter) => {
                reporter.report();
            }
            Err(err) => error!(task = "metrics", error = %err, "background loop ended abnormally"),
        }

        *self.status.write() = DriverStatus::Stopped;
        let summary = self.summary();
        info!(
            processed = summary.processed,
            errors = summary.errors,
            abandoned = summary.abandoned,
            batches = summary.batches,
            "Driver stopped"
        );
        Ok(summary)
    }

    /// Signal shutdown; `run` returns once draining is finished
    pub fn shutdown(&self) {
        {
            let mut status = self.status.write();
            if *status == DriverStatus::Running {
                *status = DriverStatus::Draining;
            }
        }
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn status(&self) -> DriverStatus {
        *self.status.read()
    }

    /// Current totals
    pub fn summary(&self) -> DriverSummary {
        DriverSummary {
            processed: self.counters.processed(),
            errors: self.counters.errors(),
            abandoned: self.counters.abandoned(),
            batches: self.counters.batches(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Shared intake buffer and registry
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn counters(&self) -> &Arc<DriverCounters> {
        &self.counters
    }

    pub fn pool(&self) -> &Arc<BatchPool> {
        &self.pool
    }
}
