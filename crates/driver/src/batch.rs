//! Batches, retry units, and the outcomes the pool reports back

use serde::{Deserialize, Serialize};

use crate::registry::Claim;
use crate::store::{ItemResult, StoreError};

/// A single identifier being retried on its own after a call-level failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryUnit {
    pub id: String,
    /// Registration the failed call belonged to
    pub generation: u64,
    /// Retry attempts already made (0 right after the batch failure)
    pub attempts: u32,
}

impl RetryUnit {
    pub fn new(id: impl Into<String>, generation: u64) -> Self {
        Self {
            id: id.into(),
            generation,
            attempts: 0,
        }
    }
}

/// What a submission carries besides its identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    /// Freshly fetched identifiers
    Fresh,
    /// A singleton retry with the attempts made before this one
    Retry { attempts: u32 },
}

/// One unit of work handed to the pool; never mutated after submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Monotonic id, for logging and correlation only
    pub batch_id: u64,
    pub items: Vec<String>,
    /// Registration generation of each entry in `items`, same order
    pub generations: Vec<u64>,
    pub kind: SubmissionKind,
}

impl Submission {
    pub fn fresh(batch_id: u64, claims: Vec<Claim>) -> Self {
        let (items, generations) = claims
            .into_iter()
            .map(|claim| (claim.id, claim.generation))
            .unzip();
        Self {
            batch_id,
            items,
            generations,
            kind: SubmissionKind::Fresh,
        }
    }

    pub fn retry(batch_id: u64, unit: RetryUnit) -> Self {
        Self {
            batch_id,
            items: vec![unit.id],
            generations: vec![unit.generation],
            kind: SubmissionKind::Retry {
                attempts: unit.attempts,
            },
        }
    }

    /// Registration generation `id` was submitted under
    pub fn generation_of(&self, id: &str) -> Option<u64> {
        self.items
            .iter()
            .position(|item| item == id)
            .and_then(|index| self.generations.get(index).copied())
    }

    /// Identifiers paired with their generations
    pub fn claims(&self) -> impl Iterator<Item = Claim> + '_ {
        self.items
            .iter()
            .zip(&self.generations)
            .map(|(id, generation)| Claim::new(id.clone(), *generation))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A resolved submission as delivered on the results channel
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub submission: Submission,
    /// `Err` is a call-level failure covering every identifier in the submission
    pub result: Result<Vec<ItemResult>, StoreError>,
}

/// Split drained claims into batches of `batch_size`, in order
///
/// The last batch may be smaller; no batch is empty.
pub fn assemble_batches<F>(claims: Vec<Claim>, batch_size: usize, mut next_id: F) -> Vec<Submission>
where
    F: FnMut() -> u64,
{
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(claims.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);

    for claim in claims {
        current.push(claim);
        if current.len() >= batch_size {
            let items = std::mem::replace(&mut current, Vec::with_capacity(batch_size));
            batches.push(Submission::fresh(next_id(), items));
        }
    }
    if !current.is_empty() {
        batches.push(Submission::fresh(next_id(), current));
    }

    batches
}
