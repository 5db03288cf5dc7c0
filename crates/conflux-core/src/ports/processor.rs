//! ProcessingUnit port - one pluggable unit of work.
//!
//! A processing unit is a capability, not an instance: `name()` is the
//! identity that keys the uniqueness invariant on partial results, and any
//! number of physical workers may share it without affecting the
//! aggregation contract.

use async_trait::async_trait;

use crate::domain::ids::SignalId;

/// A stateless worker: given a signal and its input value, produce this
/// unit's numeric contribution or fail.
///
/// Failures are best-effort: the bus redelivers the trigger with backoff,
/// and a unit that never succeeds simply leaves its contribution out of the
/// aggregate (the timeout reaper completes with whatever arrived).
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    /// The unit identity reported as `source` on partial results.
    fn name(&self) -> &str;

    async fn transform(&self, signal_id: SignalId, value: i64) -> Result<i64, String>;
}
