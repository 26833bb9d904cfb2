//! Intake buffer and in-progress registry
//!
//! Both live behind a single mutex so the fetcher's "register and enqueue"
//! and the dispatcher's "drain" never interleave. Presence in the registry
//! is the only thing that keeps the fetcher from handing the same
//! identifier out twice.
//!
//! Every registration gets a fresh generation number. Releases name the
//! generation they belong to, so a call that outlived its registration
//! (purged by expiry, then fetched again) cannot release the newer one.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy)]
struct Registration {
    seen: Instant,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    buffer: Vec<Claim>,
    in_progress: HashMap<String, Registration>,
    next_generation: u64,
}

/// A registered identifier handed out by [`WorkQueue::drain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: String,
    /// Registration this claim belongs to
    pub generation: u64,
}

impl Claim {
    pub fn new(id: impl Into<String>, generation: u64) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }
}

/// Result of handing one fetched page to the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    /// Identifiers returned by the store
    pub fetched: usize,
    /// Identifiers that were not already registered
    pub new: usize,
}

/// Shared intake buffer plus in-progress registry
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and buffer every identifier not already in progress
    pub fn intake<I>(&self, ids: I, now: Instant) -> IntakeReport
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock();
        let mut report = IntakeReport::default();

        for id in ids {
            report.fetched += 1;
            if state.in_progress.contains_key(&id) {
                trace!(execution = %id, "already in progress");
                continue;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state
                .in_progress
                .insert(id.clone(), Registration { seen: now, generation });
            state.buffer.push(Claim { id, generation });
            report.new += 1;
        }

        report
    }

    /// Take everything buffered since the last drain
    pub fn drain(&self) -> Vec<Claim> {
        std::mem::take(&mut self.state.lock().buffer)
    }

    /// Release an identifier whatever registration it holds
    pub fn release(&self, id: &str) -> bool {
        self.state.lock().in_progress.remove(id).is_some()
    }

    /// Release an identifier only while `generation` is its current registration
    pub fn release_if(&self, id: &str, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.in_progress.get(id).map(|entry| entry.generation) {
            Some(current) if current == generation => {
                state.in_progress.remove(id);
                true
            }
            Some(current) => {
                debug!(
                    execution = %id,
                    generation,
                    current,
                    "registration superseded, keeping newer entry"
                );
                false
            }
            None => false,
        }
    }

    /// Check that `generation` is still the live registration of `id`
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.state
            .lock()
            .in_progress
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Release every registry entry last seen before `now - ttl`
    pub fn purge_expired(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let Some(cutoff) = now.checked_sub(ttl) else {
            return vec![];
        };

        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .in_progress
            .iter()
            .filter(|(_, entry)| entry.seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.in_progress.remove(id);
            info!(execution = %id, "aged out in-progress execution");
        }
        expired
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.lock().in_progress.contains_key(id)
    }

    /// Registry size
    pub fn in_progress(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    /// Identifiers waiting to be batched
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn drained_ids(queue: &WorkQueue) -> Vec<String> {
        queue.drain().into_iter().map(|claim| claim.id).collect()
    }

    #[test]
    fn test_intake_deduplicates_registered_ids() {
        let queue = WorkQueue::new();
        let now = Instant::now();

        let first = queue.intake(ids(&["a", "b"]), now);
        assert_eq!(first, IntakeReport { fetched: 2, new: 2 });

        let second = queue.intake(ids(&["b", "c"]), now);
        assert_eq!(second, IntakeReport { fetched: 2, new: 1 });

        assert_eq!(drained_ids(&queue), ids(&["a", "b", "c"]));
        assert_eq!(queue.buffered(), 0);
        assert_eq!(queue.in_progress(), 3);

        // Still registered after the drain, so not re-buffered
        let third = queue.intake(ids(&["a"]), now);
        assert_eq!(third.new, 0);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_release_makes_id_fetchable_again() {
        let queue = WorkQueue::new();
        let now = Instant::now();
        queue.intake(ids(&["a"]), now);
        queue.drain();

        assert!(queue.release("a"));
        assert!(!queue.release("a"));
        assert_eq!(queue.intake(ids(&["a"]), now).new, 1);
    }

    #[test]
    fn test_purge_expired_releases_old_entries() {
        let queue = WorkQueue::new();
        let start = Instant::now();
        queue.intake(ids(&["old"]), start);
        queue.intake(ids(&["fresh"]), start + Duration::from_secs(30));

        let ttl = Duration::from_secs(60);
        assert!(queue.purge_expired(ttl, start + Duration::from_secs(59)).is_empty());

        let purged = queue.purge_expired(ttl, start + Duration::from_secs(61));
        assert_eq!(purged, ids(&["old"]));
        assert!(!queue.is_registered("old"));
        assert!(queue.is_registered("fresh"));
    }

    #[test]
    fn test_each_registration_gets_new_generation() {
        let queue = WorkQueue::new();
        let now = Instant::now();
        queue.intake(ids(&["a", "b"]), now);
        let claims = queue.drain();
        assert_ne!(claims[0].generation, claims[1].generation);

        assert!(queue.release("a"));
        queue.intake(ids(&["a"]), now);
        let again = queue.drain();
        assert_eq!(again.len(), 1);
        assert!(again[0].generation > claims[1].generation);
    }

    #[test]
    fn test_stale_release_keeps_newer_registration() {
        let queue = WorkQueue::new();
        let start = Instant::now();
        let ttl = Duration::from_secs(60);

        queue.intake(ids(&["x"]), start);
        let first = queue.drain().remove(0);

        // Expired while its call is still running, then fetched again
        queue.purge_expired(ttl, start + Duration::from_secs(61));
        queue.intake(ids(&["x"]), start + Duration::from_secs(62));
        let second = queue.drain().remove(0);

        assert!(!queue.release_if(&first.id, first.generation));
        assert!(queue.is_registered("x"));
        assert!(!queue.is_current("x", first.generation));
        assert!(queue.is_current("x", second.generation));
        assert_eq!(queue.intake(ids(&["x"]), start + Duration::from_secs(63)).new, 0);

        assert!(queue.release_if(&second.id, second.generation));
        assert!(!queue.is_registered("x"));
    }
}
