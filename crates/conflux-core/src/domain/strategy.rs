//! Aggregation strategy: how partial values fold into a final result.
//!
//! The source values are placeholder business rules, so the fold is a trait
//! seam rather than a hard-coded sum. The store applies the strategy inside
//! its completion compare-and-set, so the computed result and the completion
//! flip are atomic.

/// Folds the values present at completion time into the final result.
///
/// Must be a pure function of the input slice: it can run under the store's
/// lock and may be retried on a different candidate set after a lost race.
pub trait AggregationStrategy: Send + Sync {
    fn combine(&self, values: &[i64]) -> i64;
}

/// Default strategy: plain sum of all contributed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumStrategy;

impl AggregationStrategy for SumStrategy {
    fn combine(&self, values: &[i64]) -> i64 {
        values.iter().sum()
    }
}
