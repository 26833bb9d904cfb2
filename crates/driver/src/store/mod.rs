//! Remote store abstraction
//!
//! This module provides:
//! - [`RemoteStore`] trait for the orchestration store the driver consumes
//! - [`InMemoryRemoteStore`] for testing and local runs
//! - [`HttpRemoteStore`] for the state-conductor data services

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::{HttpRemoteStore, HttpStoreConfig};
pub use memory::InMemoryRemoteStore;

/// Error type for remote store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with a non-success status
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be interpreted
    #[error("decode error: {0}")]
    Decode(String),

    /// The store is not reachable or refused the call
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the arguments of the call
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Paginated candidate listing request
///
/// `start` is 1-based, matching the remote data service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    pub start: usize,
    pub count: usize,
    /// Comma-separated state machine names
    pub names: Option<String>,
    /// Statuses to include; empty means the store's default ("new", "working")
    pub status: Vec<String>,
}

impl CandidateQuery {
    pub fn page(start: usize, count: usize) -> Self {
        Self {
            start,
            count,
            ..Default::default()
        }
    }
}

/// Per-identifier outcome of a `process_batch` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// The orchestration store that owns work items and executes them
///
/// `process_batch` must process each identifier independently: one item's
/// failure is reported in its [`ItemResult`] and does not fail the call.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// List identifiers eligible for processing
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<String>, StoreError>;

    /// Run one processing step for each identifier
    async fn process_batch(&self, ids: &[String]) -> Result<Vec<ItemResult>, StoreError>;

    /// Create a work item for `target_uri` under the state machine `kind`
    async fn create_work_item(&self, target_uri: &str, kind: &str) -> Result<String, StoreError>;

    /// Number of healthy backend nodes
    async fn active_node_count(&self) -> Result<usize, StoreError>;

    /// List documents a state machine could be started on (1-based `start`)
    async fn find_targets(
        &self,
        kind: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, StoreError>;
}
