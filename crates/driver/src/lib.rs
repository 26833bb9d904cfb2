//! # Conductor Driver
//!
//! A batching work-dispatch engine that keeps a remote execution store moving:
//! it pulls identifiers of pending executions, submits them in small batches
//! to a bounded worker pool, and sizes that pool to the backend's capacity.
//!
//! ## Features
//!
//! - **At-most-one in flight**: an identifier is never handed out again while a batch holding it is outstanding
//! - **Bounded retries**: call-level failures are retried one identifier at a time, then abandoned
//! - **Backpressure**: fetching pauses while too much work is in progress
//! - **Expiry**: entries whose results never arrive are released after a TTL
//! - **Adaptive capacity**: the pool follows the number of active backend nodes
//! - **Graceful drain**: shutdown waits for every in-flight batch
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   intake    ┌──────────────────────────┐   drain   ┌──────────────┐
//! │   Fetcher    │ ──────────▶ │        WorkQueue         │ ────────▶ │  Dispatcher  │
//! │ (paged poll) │             │ (buffer + in-progress)   │ ◀──────── │ (batch/reap) │
//! └──────────────┘             └──────────────────────────┘  release  └──────────────┘
//!        │                                                              │      ▲
//!        ▼                                                       submit │      │ results
//! ┌──────────────┐             ┌──────────────────────────┐            ▼      │
//! │ RemoteStore  │ ◀────────── │        BatchPool         │ ◀─────────────────┘
//! │ (HTTP/memory)│   process   │ (resizable semaphore)    │
//! └──────────────┘             └──────────────────────────┘
//!        ▲                                  ▲
//!        │ node count                       │ resize
//!        └──────── CapacityController ──────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor_driver::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = HttpRemoteStore::new(
//!     HttpStoreConfig::new("http://localhost:8000")
//!         .with_credentials("admin", "admin"),
//! )?;
//! let driver = Driver::new(Arc::new(store), DriverConfig::default())?;
//! let summary = driver.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod capacity;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod fetcher;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod seeder;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{BatchOutcome, RetryUnit, Submission, SubmissionKind};
    pub use crate::config::{ConfigError, DriverConfig, SeederConfig};
    pub use crate::driver::{Driver, DriverError, DriverStatus, DriverSummary};
    pub use crate::metrics::{DriverCounters, MetricsSnapshot};
    pub use crate::pool::{BatchPool, PoolError};
    pub use crate::registry::{Claim, WorkQueue};
    pub use crate::retry::{Classification, RetryPolicy};
    pub use crate::store::{
        CandidateQuery, HttpRemoteStore, HttpStoreConfig, InMemoryRemoteStore, ItemResult,
        RemoteStore, StoreError,
    };
}

// Re-export key types at crate root
pub use batch::{BatchOutcome, RetryUnit, Submission, SubmissionKind};
pub use capacity::{scaled_pool_size, CapacityCheck, CapacityController};
pub use config::{ConfigError, DriverConfig, SeederConfig};
pub use dispatcher::{DispatchReport, Dispatcher, ReapReport};
pub use driver::{Driver, DriverError, DriverStatus, DriverSummary};
pub use fetcher::{Cadence, FetchCycle, Fetcher};
pub use metrics::{DriverCounters, MetricsReporter, MetricsSnapshot};
pub use pool::{BatchPool, PoolError};
pub use registry::{Claim, IntakeReport, WorkQueue};
pub use retry::{Classification, RetryManager, RetryPolicy};
pub use seeder::{SeedCycle, TargetSeeder};
pub use store::{
    CandidateQuery, HttpRemoteStore, HttpStoreConfig, InMemoryRemoteStore, ItemResult,
    RemoteStore, StoreError,
};
