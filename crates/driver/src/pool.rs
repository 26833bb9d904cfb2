//! Resizable worker pool for batch submissions
//!
//! Submitted jobs are spawned immediately and wait for a semaphore permit
//! before running, so submission never blocks the dispatcher. The number of
//! permits is the pool's maximum size and can be changed while jobs run:
//! growing adds permits, shrinking forgets idle permits and records the rest
//! as debt that is paid off as running jobs finish.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// The pool no longer accepts work
    #[error("worker pool is closed")]
    Closed,
}

#[derive(Debug)]
struct Sizing {
    max: usize,
    /// Permits still to be retired after a shrink
    debt: usize,
}

/// Worker pool with a live-adjustable concurrency limit
pub struct BatchPool {
    semaphore: Arc<Semaphore>,
    sizing: Arc<Mutex<Sizing>>,
    tracker: TaskTracker,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl BatchPool {
    /// Create a pool running at most `size` jobs at once (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            sizing: Arc::new(Mutex::new(Sizing { max: size, debt: 0 })),
            tracker: TaskTracker::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a job; it runs once a slot is free
    pub fn spawn<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(PoolError::Closed);
        }

        let semaphore = Arc::clone(&self.semaphore);
        let sizing = Arc::clone(&self.sizing);
        let queued = Arc::clone(&self.queued);
        let in_flight = Arc::clone(&self.in_flight);

        queued.fetch_add(1, Ordering::SeqCst);
        self.tracker.spawn(async move {
            let permit = semaphore.acquire_owned().await;
            queued.fetch_sub(1, Ordering::SeqCst);
            let Ok(permit) = permit else {
                return;
            };

            in_flight.fetch_add(1, Ordering::SeqCst);
            let _slot = Slot {
                permit: Some(permit),
                sizing,
                in_flight,
            };
            job.await;
        });
        Ok(())
    }

    /// Change the maximum number of concurrently running jobs (minimum 1)
    ///
    /// Returns the previous maximum.
    pub fn resize(&self, new_max: usize) -> usize {
        let new_max = new_max.max(1);
        let mut sizing = self.sizing.lock();
        let previous = sizing.max;

        if new_max > previous {
            let grow = new_max - previous;
            let cancelled = grow.min(sizing.debt);
            sizing.debt -= cancelled;
            self.semaphore.add_permits(grow - cancelled);
        } else if new_max < previous {
            let shrink = previous - new_max;
            let retired = self.semaphore.forget_permits(shrink);
            sizing.debt += shrink - retired;
        }

        sizing.max = new_max;
        debug!(previous, new_max, debt = sizing.debt, "resized worker pool");
        previous
    }

    /// Current maximum concurrency
    pub fn max_size(&self) -> usize {
        self.sizing.lock().max
    }

    /// Jobs waiting for a slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting new jobs; already submitted jobs still run
    pub fn close(&self) {
        self.tracker.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Wait for every submitted job after [`close`](Self::close)
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

/// A running job's slot; returns or retires the permit when dropped
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    sizing: Arc<Mutex<Sizing>>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let Some(permit) = self.permit.take() else {
            return;
        };

        let mut sizing = self.sizing.lock();
        if sizing.debt > 0 {
            sizing.debt -= 1;
            permit.forget();
        }
    }
}
