//! Pipeline status snapshot, for operators and tests.

use serde::{Deserialize, Serialize};

use crate::ports::bus::DeliveryCounts;
use crate::ports::store::AggregateCounts;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub aggregates: AggregateCounts,
    pub delivery: DeliveryCounts,
    pub dead_letters: usize,
}
