//! Notifier: bridges `AggregationCompleted` to the completion sink.
//!
//! A sink error fails the lease, so delivery retries with backoff. The sink
//! contract allows duplicate notifications, which keeps this handler
//! trivially idempotent.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::PipelineError;
use crate::domain::event::AggregationCompleted;
use crate::ports::sink::CompletionSink;

use super::worker::EventHandler;

pub struct Notifier {
    sink: Arc<dyn CompletionSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventHandler<AggregationCompleted> for Notifier {
    async fn handle(&self, event: AggregationCompleted) -> Result<(), PipelineError> {
        self.sink.notify(event).await.map_err(PipelineError::Sink)
    }
}
