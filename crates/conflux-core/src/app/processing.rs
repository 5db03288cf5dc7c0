//! Processing stage: one handler per unit identity.
//!
//! Consumes `FanOutTrigger`, runs the unit's transform, and publishes the
//! contribution as a `PartialResult` attributed to the unit's name. A
//! transform failure fails the lease, so the bus redelivers with backoff;
//! once the budget runs out the dead-letter hook publishes `ProcessFailed`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::errors::PipelineError;
use crate::domain::event::{FanOutTrigger, PartialResult, ProcessFailed};
use crate::domain::ids::Source;
use crate::ports::bus::{MessageBus, MessageBusExt};
use crate::ports::clock::Clock;
use crate::ports::processor::ProcessingUnit;

use super::worker::EventHandler;

pub struct ProcessingWorker {
    unit: Arc<dyn ProcessingUnit>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl ProcessingWorker {
    pub fn new(
        unit: Arc<dyn ProcessingUnit>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { unit, bus, clock }
    }
}

#[async_trait]
impl EventHandler<FanOutTrigger> for ProcessingWorker {
    async fn handle(&self, event: FanOutTrigger) -> Result<(), PipelineError> {
        let output = self
            .unit
            .transform(event.signal_id, event.value)
            .await
            .map_err(|reason| PipelineError::Processor {
                name: self.unit.name().to_string(),
                signal_id: event.signal_id,
                reason,
            })?;

        let partial = PartialResult {
            signal_id: event.signal_id,
            source: Source::new(self.unit.name()),
            value: output,
            timestamp: self.clock.now(),
        };
        self.bus.publish_event(&partial).await?;

        debug!(
            signal_id = %event.signal_id,
            unit = %self.unit.name(),
            output,
            "partial result published"
        );
        Ok(())
    }

    /// Retry budget exhausted for this unit on this signal. The signal can
    /// still complete partially via the timeout path, but operators need
    /// the failure on record.
    async fn on_dead_letter(&self, event: FanOutTrigger, error: &PipelineError) {
        let failed = ProcessFailed {
            signal_id: event.signal_id,
            source: Source::new(self.unit.name()),
            reason: error.to_string(),
            timestamp: self.clock.now(),
        };
        // Best effort: a bus refusing the failure event has bigger problems
        if let Err(e) = self.bus.publish_event(&failed).await {
            tracing::error!(
                signal_id = %event.signal_id,
                unit = %self.unit.name(),
                error = %e,
                "could not publish ProcessFailed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::event::Event;
    use crate::domain::ids::SignalId;
    use crate::impls::memory_bus::InMemoryBus;
    use crate::impls::sim_processor::SimulatedProcessor;
    use crate::ports::bus::RetryPolicy;
    use crate::ports::clock::SystemClock;

    fn trigger(value: i64) -> FanOutTrigger {
        FanOutTrigger {
            signal_id: SignalId::generate(),
            value,
            timestamp: Utc::now(),
        }
    }

    fn worker(bus: Arc<InMemoryBus>, unit: SimulatedProcessor) -> ProcessingWorker {
        ProcessingWorker::new(Arc::new(unit), bus, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn successful_transform_publishes_an_attributed_partial() {
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::default()));
        let probe = bus.subscribe(PartialResult::TOPIC, "probe").await.unwrap();

        let unit = SimulatedProcessor::new("unit-alpha")
            .with_factor(4)
            .with_delay_ms(0, 0)
            .with_failure_probability(0.0);
        let worker = worker(bus, unit);

        let event = trigger(3);
        worker.handle(event.clone()).await.unwrap();

        let lease = probe.lease().await.unwrap();
        let partial: PartialResult = serde_json::from_value(lease.payload().clone()).unwrap();
        assert_eq!(partial.signal_id, event.signal_id);
        assert_eq!(partial.source, Source::new("unit-alpha"));
        assert_eq!(partial.value, 12);
    }

    #[tokio::test]
    async fn transform_failure_propagates_as_processor_error() {
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::default()));
        let unit = SimulatedProcessor::new("unit-beta")
            .with_delay_ms(0, 0)
            .with_failure_probability(1.0);
        let worker = worker(bus, unit);

        let err = worker.handle(trigger(3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Processor { .. }));
        assert!(err.to_string().contains("unit-beta"));
    }

    #[tokio::test]
    async fn dead_letter_hook_publishes_process_failed() {
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::default()));
        let probe = bus.subscribe(ProcessFailed::TOPIC, "probe").await.unwrap();

        let unit = SimulatedProcessor::new("unit-gamma")
            .with_delay_ms(0, 0)
            .with_failure_probability(1.0);
        let worker = worker(bus, unit);

        let event = trigger(3);
        let error = PipelineError::Processor {
            name: "unit-gamma".into(),
            signal_id: event.signal_id,
            reason: "boom".into(),
        };
        worker.on_dead_letter(event.clone(), &error).await;

        let lease = probe.lease().await.unwrap();
        let failed: ProcessFailed = serde_json::from_value(lease.payload().clone()).unwrap();
        assert_eq!(failed.signal_id, event.signal_id);
        assert_eq!(failed.source, Source::new("unit-gamma"));
        assert!(failed.reason.contains("boom"));
    }
}
