//! In-memory implementation of RemoteStore for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{CandidateQuery, ItemResult, RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemStatus {
    New,
    Working,
    Completed,
    Failed,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Internal work item state
struct ItemState {
    id: String,
    kind: String,
    target: Option<String>,
    status: ItemStatus,
    steps_remaining: u32,
}

/// In-memory implementation of RemoteStore
///
/// Items are listed in insertion order. Each successful processing step
/// decrements the item's remaining steps; it stops being a candidate once it
/// reaches zero. Failures and latency can be injected for tests.
///
/// # Example
///
/// ```
/// use conductor_driver::InMemoryRemoteStore;
///
/// let store = InMemoryRemoteStore::new();
/// store.add_items(["/executions/a.json", "/executions/b.json"]);
/// assert_eq!(store.pending_count(), 2);
/// ```
pub struct InMemoryRemoteStore {
    items: RwLock<Vec<ItemState>>,
    targets: RwLock<HashMap<String, Vec<String>>>,
    calls: RwLock<Vec<Vec<String>>>,
    business_failures: RwLock<HashMap<String, String>>,
    failing_ids: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
    fail_next_calls: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_node_count: AtomicBool,
    active_nodes: AtomicUsize,
    fetch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryRemoteStore {
    /// Create a new in-memory store reporting a single active node
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            targets: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            business_failures: RwLock::new(HashMap::new()),
            failing_ids: RwLock::new(HashSet::new()),
            latency: RwLock::new(Duration::ZERO),
            fail_next_calls: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            fail_node_count: AtomicBool::new(false),
            active_nodes: AtomicUsize::new(1),
            fetch_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Add a pending item that completes after one processing step
    pub fn add_item(&self, id: impl Into<String>) {
        self.add_item_with_steps(id, 1);
    }

    /// Add a pending item that needs `steps` successful processing calls
    pub fn add_item_with_steps(&self, id: impl Into<String>, steps: u32) {
        self.items.write().push(ItemState {
            id: id.into(),
            kind: "default".to_string(),
            target: None,
            status: ItemStatus::New,
            steps_remaining: steps.max(1),
        });
    }

    pub fn add_items<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.add_item(id);
        }
    }

    /// Register documents that `find_targets` reports for `kind`
    pub fn add_targets<I, S>(&self, kind: &str, uris: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets
            .write()
            .entry(kind.to_string())
            .or_default()
            .extend(uris.into_iter().map(Into::into));
    }

    /// Report `error` for `id` on every processing call (call still succeeds)
    pub fn set_business_failure(&self, id: impl Into<String>, error: impl Into<String>) {
        self.business_failures
            .write()
            .insert(id.into(), error.into());
    }

    /// Fail every `process_batch` call that includes `id`
    pub fn fail_calls_containing(&self, id: impl Into<String>) {
        self.failing_ids.write().insert(id.into());
    }

    /// Stop failing calls that include `id`
    pub fn clear_call_failure(&self, id: &str) {
        self.failing_ids.write().remove(id);
    }

    /// Fail the next `count` `process_batch` calls
    pub fn fail_next_process_calls(&self, count: usize) {
        self.fail_next_calls.store(count, Ordering::SeqCst);
    }

    pub fn set_fetch_failure(&self, failing: bool) {
        self.fail_fetches.store(failing, Ordering::SeqCst);
    }

    pub fn set_node_count_failure(&self, failing: bool) {
        self.fail_node_count.store(failing, Ordering::SeqCst);
    }

    pub fn set_active_nodes(&self, nodes: usize) {
        self.active_nodes.store(nodes, Ordering::SeqCst);
    }

    /// Delay applied to every `process_batch` call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Every `process_batch` call so far, in call order
    pub fn process_calls(&self) -> Vec<Vec<String>> {
        self.calls.read().clone()
    }

    /// Number of `process_batch` calls that included `id`
    pub fn calls_containing(&self, id: &str) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|call| call.iter().any(|c| c == id))
            .count()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `process_batch` calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Restart peak tracking from the calls running right now
    pub fn reset_peak_concurrency(&self) {
        let current = self.in_flight.load(Ordering::SeqCst);
        self.peak_in_flight.store(current, Ordering::SeqCst);
    }

    /// Items still eligible for processing
    pub fn pending_count(&self) -> usize {
        self.items
            .read()
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::New | ItemStatus::Working))
            .count()
    }

    /// Identifiers that finished all their steps
    pub fn completed_ids(&self) -> Vec<String> {
        self.ids_with_status(ItemStatus::Completed)
    }

    /// Identifiers that ended in a reported failure
    pub fn failed_ids(&self) -> Vec<String> {
        self.ids_with_status(ItemStatus::Failed)
    }

    /// `(id, target)` pairs of items created through `create_work_item`
    pub fn created_items(&self) -> Vec<(String, String)> {
        self.items
            .read()
            .iter()
            .filter_map(|i| i.target.clone().map(|t| (i.id.clone(), t)))
            .collect()
    }

    fn ids_with_status(&self, status: ItemStatus) -> Vec<String> {
        self.items
            .read()
            .iter()
            .filter(|i| i.status == status)
            .map(|i| i.id.clone())
            .collect()
    }

    fn should_fail_call(&self, ids: &[String]) -> Option<StoreError> {
        let injected = self
            .fail_next_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Some(StoreError::Unavailable("injected failure".into()));
        }

        let failing = self.failing_ids.read();
        ids.iter()
            .find(|id| failing.contains(*id))
            .map(|id| StoreError::Transport(format!("connection reset while processing {id}")))
    }

    fn apply_step(&self, id: &str) -> ItemResult {
        let business_error = self.business_failures.read().get(id).cloned();
        let mut items = self.items.write();
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return ItemResult::failure(id, "execution not found");
        };

        if let Some(error) = business_error {
            item.status = ItemStatus::Failed;
            return ItemResult::failure(id, error);
        }

        item.steps_remaining = item.steps_remaining.saturating_sub(1);
        item.status = if item.steps_remaining == 0 {
            ItemStatus::Completed
        } else {
            ItemStatus::Working
        };
        ItemResult::success(id)
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge when a call finishes or is dropped
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<String>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fetch failure".into()));
        }

        let names = crate::config::split_list(query.names.as_deref());
        let items = self.items.read();
        let ids = items
            .iter()
            .filter(|i| {
                if query.status.is_empty() {
                    matches!(i.status, ItemStatus::New | ItemStatus::Working)
                } else {
                    query.status.iter().any(|s| s == i.status.as_str())
                }
            })
            .filter(|i| names.is_empty() || names.contains(&i.kind))
            .skip(query.start.saturating_sub(1))
            .take(query.count)
            .map(|i| i.id.clone())
            .collect();
        Ok(ids)
    }

    async fn process_batch(&self, ids: &[String]) -> Result<Vec<ItemResult>, StoreError> {
        self.calls.write().push(ids.to_vec());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.should_fail_call(ids) {
            return Err(error);
        }

        Ok(ids.iter().map(|id| self.apply_step(id)).collect())
    }

    async fn create_work_item(&self, target_uri: &str, kind: &str) -> Result<String, StoreError> {
        if kind.is_empty() {
            return Err(StoreError::Rejected("state machine name is required".into()));
        }
        let id = format!("/executions/{}.json", Uuid::now_v7());
        self.items.write().push(ItemState {
            id: id.clone(),
            kind: kind.to_string(),
            target: Some(target_uri.to_string()),
            status: ItemStatus::New,
            steps_remaining: 1,
        });
        Ok(id)
    }

    async fn active_node_count(&self) -> Result<usize, StoreError> {
        if self.fail_node_count.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected host status failure".into()));
        }
        Ok(self.active_nodes.load(Ordering::SeqCst))
    }

    async fn find_targets(
        &self,
        kind: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        let covered: HashSet<String> = self
            .items
            .read()
            .iter()
            .filter(|i| i.kind == kind)
            .filter_map(|i| i.target.clone())
            .collect();

        let targets = self.targets.read();
        let uris = targets
            .get(kind)
            .map(|all| {
                all.iter()
                    .filter(|uri| !covered.contains(*uri))
                    .skip(start.saturating_sub(1))
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(uris)
    }
}
