//! Pipeline configuration.
//!
//! Serde-friendly so a host can load it from a file; every field has a
//! default matching the production tuning.

use serde::{Deserialize, Serialize};

use crate::ports::bus::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Distinct sources that complete an aggregate naturally.
    pub expected_results: usize,

    /// Age at which an open aggregate becomes eligible for forced
    /// completion.
    pub timeout_secs: u64,

    /// Reaper sweep interval.
    pub sweep_interval_ms: u64,

    /// Redelivery policy for failed message handling.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            expected_results: 3,
            timeout_secs: 30,
            sweep_interval_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}
