//! Dispatcher: turns one accepted signal into one fan-out trigger.
//!
//! The trigger topic is what the processing-unit groups subscribe to, so a
//! single publish here reaches every unit identity. Publishing is idempotent
//! enough for at-least-once: a redelivered `SignalReceived` re-publishes the
//! trigger, and downstream dedup (the store's uniqueness constraint)
//! absorbs the duplicates.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::errors::PipelineError;
use crate::domain::event::{FanOutTrigger, SignalReceived};
use crate::ports::bus::{MessageBus, MessageBusExt};

use super::worker::EventHandler;

pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventHandler<SignalReceived> for Dispatcher {
    async fn handle(&self, event: SignalReceived) -> Result<(), PipelineError> {
        let trigger = FanOutTrigger {
            signal_id: event.signal_id,
            value: event.value,
            timestamp: event.timestamp,
        };
        self.bus.publish_event(&trigger).await?;

        debug!(signal_id = %event.signal_id, value = event.value, "fan-out trigger published");
        Ok(())
    }
}
