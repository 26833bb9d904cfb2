//! Result classification and retry bookkeeping
//!
//! Only call-level failures are retried. A call that succeeds is terminal for
//! every identifier it reports on, including those the store flagged as
//! failed; those count as errors but are never resubmitted.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::batch::{BatchOutcome, RetryUnit, SubmissionKind};
use crate::metrics::DriverCounters;
use crate::registry::{Claim, WorkQueue};

/// Bound on singleton retries after a call-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry attempts allowed per identifier
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Check if another attempt may follow `attempts` failed ones
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// How a resolved submission affects the registry and retry queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The call returned; every reported identifier is finished
    Completed {
        processed: usize,
        business_failures: usize,
    },
    /// Call-level failure; these units go out again next tick
    Retry(Vec<RetryUnit>),
    /// A retry unit ran out of attempts
    Abandoned(RetryUnit),
}

impl RetryPolicy {
    /// Decide what a resolved submission means, without side effects
    pub fn classify(&self, outcome: &BatchOutcome) -> Classification {
        match (&outcome.result, outcome.submission.kind) {
            (Ok(results), _) => Classification::Completed {
                processed: results.len(),
                business_failures: results.iter().filter(|r| !r.succeeded).count(),
            },
            (Err(_), SubmissionKind::Fresh) => Classification::Retry(
                outcome
                    .submission
                    .claims()
                    .map(|claim| RetryUnit::new(claim.id, claim.generation))
                    .collect(),
            ),
            (Err(_), SubmissionKind::Retry { attempts }) => {
                let attempts = attempts + 1;
                let claim = outcome
                    .submission
                    .claims()
                    .next()
                    .unwrap_or_else(|| Claim::new(String::new(), 0));
                let unit = RetryUnit {
                    id: claim.id,
                    generation: claim.generation,
                    attempts,
                };
                if self.has_attempts_remaining(attempts) {
                    Classification::Retry(vec![unit])
                } else {
                    Classification::Abandoned(unit)
                }
            }
        }
    }
}

/// Applies classifications to the shared registry and counters
pub struct RetryManager {
    policy: RetryPolicy,
    queue: Arc<WorkQueue>,
    counters: Arc<DriverCounters>,
    pending: Vec<RetryUnit>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, queue: Arc<WorkQueue>, counters: Arc<DriverCounters>) -> Self {
        Self {
            policy,
            queue,
            counters,
            pending: Vec::new(),
        }
    }

    /// Classify a resolved submission and apply its effects
    pub fn reap(&mut self, outcome: BatchOutcome) -> Classification {
        let classification = self.policy.classify(&outcome);
        let batch_id = outcome.submission.batch_id;

        let err = match outcome.result {
            Ok(results) => {
                let mut errors = 0;
                for result in &results {
                    match outcome.submission.generation_of(&result.id) {
                        Some(generation) => {
                            self.queue.release_if(&result.id, generation);
                        }
                        None => debug!(
                            batch_id,
                            execution = %result.id,
                            "result for unsubmitted execution"
                        ),
                    }
                    if !result.succeeded {
                        errors += 1;
                        warn!(
                            batch_id,
                            execution = %result.id,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "execution reported failure"
                        );
                    }
                }
                self.counters.add_processed(results.len() as u64);
                self.counters.add_errors(errors);
                info!(
                    batch_id,
                    "batch result: {} executions complete - with {} errors",
                    results.len(),
                    errors
                );
                return classification;
            }
            Err(err) => err,
        };

        match &classification {
            Classification::Retry(units) => {
                match outcome.submission.kind {
                    SubmissionKind::Fresh => {
                        error!(batch_id, size = units.len(), error = %err, "batch call failed");
                        self.counters.add_errors(units.len() as u64);
                    }
                    SubmissionKind::Retry { .. } => {
                        warn!(
                            batch_id,
                            execution = %outcome.submission.items.join(","),
                            attempt = units.first().map(|u| u.attempts).unwrap_or_default(),
                            error = %err,
                            "retry attempt failed"
                        );
                    }
                }
                self.pending.extend(units.iter().cloned());
            }
            Classification::Abandoned(unit) => {
                self.queue.release_if(&unit.id, unit.generation);
                self.counters.add_abandoned(1);
                error!(
                    batch_id,
                    execution = %unit.id,
                    attempts = unit.attempts,
                    error = %err,
                    "retries exhausted, abandoning execution"
                );
            }
            // A failed call never classifies as completed
            Classification::Completed { .. } => {}
        }

        classification
    }

    /// Hand over every retry unit queued since the last call
    pub fn take_pending(&mut self) -> Vec<RetryUnit> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
