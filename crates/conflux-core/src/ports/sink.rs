//! CompletionSink port - the terminal notification boundary.
//!
//! Pure side-effecting consumer with no state this core depends on. It must
//! tolerate arbitrary redelivery: notifying twice for the same signal is
//! acceptable, so no dedup requirement is placed here.

use async_trait::async_trait;

use crate::domain::event::AggregationCompleted;

#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Deliver one completion notification. An error fails the message
    /// lease, so the bus redelivers later.
    async fn notify(&self, completed: AggregationCompleted) -> Result<(), String>;
}
