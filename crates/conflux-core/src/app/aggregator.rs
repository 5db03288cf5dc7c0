//! Aggregator: the idempotent fan-in consumer.
//!
//! At-least-once delivery makes duplicates normal here, not exceptional.
//! The store's uniqueness constraint is the dedup mechanism (a duplicate
//! insert is a successful no-op), and the completion compare-and-set
//! guarantees one `AggregationCompleted` per signal no matter how many
//! aggregator instances race, or whether the timeout reaper gets there
//! first.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::errors::PipelineError;
use crate::domain::event::{AggregationCompleted, PartialResult};
use crate::ports::bus::{MessageBus, MessageBusExt};
use crate::ports::store::{AggregateStore, InsertOutcome};

use super::worker::EventHandler;

pub struct Aggregator {
    store: Arc<dyn AggregateStore>,
    bus: Arc<dyn MessageBus>,
    expected_results: usize,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        bus: Arc<dyn MessageBus>,
        expected_results: usize,
    ) -> Self {
        Self {
            store,
            bus,
            expected_results,
        }
    }
}

#[async_trait]
impl EventHandler<PartialResult> for Aggregator {
    async fn handle(&self, event: PartialResult) -> Result<(), PipelineError> {
        let distinct_sources = match self.store.insert_partial(&event).await? {
            InsertOutcome::AlreadyExists => {
                // Redelivered or duplicate: already counted, ack and move on
                info!(
                    signal_id = %event.signal_id,
                    source = %event.source,
                    "duplicate partial result, ignored"
                );
                return Ok(());
            }
            InsertOutcome::Inserted { distinct_sources } => distinct_sources,
        };

        debug!(
            signal_id = %event.signal_id,
            source = %event.source,
            distinct_sources,
            expected = self.expected_results,
            "partial result stored"
        );

        if distinct_sources < self.expected_results {
            return Ok(());
        }

        // K-th distinct source: attempt completion. None means another
        // caller (a racing instance or the reaper) already completed it.
        let Some(completed) = self.store.try_complete(event.signal_id).await? else {
            return Ok(());
        };

        info!(
            signal_id = %completed.signal_id,
            final_result = completed.final_result,
            distinct_sources = completed.distinct_sources,
            "aggregation completed"
        );
        self.bus
            .publish_event(&AggregationCompleted {
                signal_id: completed.signal_id,
                final_result: completed.final_result,
                timestamp: completed.completed_at,
            })
            .await?;
        Ok(())
    }
}
