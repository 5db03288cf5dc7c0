//! Aggregate record: the accumulating result for one signal.
//!
//! Design:
//! - This is the "single source of truth" for per-signal aggregation state.
//! - State transitions happen via methods (not direct field access).
//! - `is_complete` is monotonic: it flips false -> true at most once, and
//!   `final_result` is set only at that flip. The store enforces the flip
//!   with compare-and-set; this record only exposes the primitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SignalId, Source};

/// One stored partial result. Created once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPartial {
    pub source: Source,
    pub value: i64,
    pub processed_at: DateTime<Utc>,
}

/// The accumulating record for one signal.
///
/// Lifecycle: created lazily on the first partial result for an unseen
/// signal id; never deleted by this subsystem (retention is external).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: SignalId,

    /// First observation of this signal by the aggregation side.
    pub created_at: DateTime<Utc>,

    /// Monotonic false -> true; never reverts.
    pub is_complete: bool,

    /// Defined only once `is_complete` is true.
    pub final_result: Option<i64>,

    /// Insertion-ordered; at most one entry per distinct source.
    pub partials: Vec<StoredPartial>,
}

impl Aggregate {
    /// Open a fresh aggregate at its first observation.
    pub fn open(id: SignalId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            is_complete: false,
            final_result: None,
            partials: Vec::new(),
        }
    }

    pub fn contains_source(&self, source: &Source) -> bool {
        self.partials.iter().any(|p| &p.source == source)
    }

    /// Number of distinct contributing sources.
    ///
    /// Equals `partials.len()` because the uniqueness invariant keeps one
    /// entry per source.
    pub fn distinct_sources(&self) -> usize {
        self.partials.len()
    }

    /// Append a partial result. The caller has already checked uniqueness.
    pub fn push_partial(&mut self, partial: StoredPartial) {
        self.partials.push(partial);
    }

    pub fn values(&self) -> Vec<i64> {
        self.partials.iter().map(|p| p.value).collect()
    }

    /// Flip to complete with the decided final result.
    ///
    /// Callers must have checked `is_complete` first, under whatever lock
    /// makes that check-and-flip atomic.
    pub fn mark_complete(&mut self, final_result: i64) {
        self.is_complete = true;
        self.final_result = Some(final_result);
    }
}

/// Summary returned by a winning completion compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedAggregate {
    pub signal_id: SignalId,
    pub final_result: i64,
    pub distinct_sources: usize,
    pub completed_at: DateTime<Utc>,
}
