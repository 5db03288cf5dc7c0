//! Signal ingress: the validated entry point into the pipeline.
//!
//! Raw submissions arrive as text. Validation happens here, before anything
//! touches the bus, so every `SignalReceived` on the wire carries a parsed
//! numeric value and a fresh signal id.

use std::sync::Arc;

use tracing::info;

use crate::domain::errors::PipelineError;
use crate::domain::event::SignalReceived;
use crate::domain::ids::SignalId;
use crate::ports::bus::{MessageBus, MessageBusExt};
use crate::ports::clock::Clock;

pub struct SignalIngress {
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl SignalIngress {
    pub fn new(bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, clock }
    }

    /// Validate one raw submission and publish it as `SignalReceived`.
    ///
    /// Returns the assigned signal id for correlation.
    pub async fn submit(&self, raw: &str) -> Result<SignalId, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidSignal("empty submission".into()));
        }
        let value: i64 = trimmed
            .parse()
            .map_err(|_| PipelineError::InvalidSignal(format!("not a number: {trimmed:?}")))?;

        let signal_id = SignalId::generate();
        let event = SignalReceived {
            signal_id,
            value,
            timestamp: self.clock.now(),
        };
        self.bus.publish_event(&event).await?;

        info!(%signal_id, value, "signal accepted");
        Ok(signal_id)
    }
}
