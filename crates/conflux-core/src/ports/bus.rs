//! MessageBus port - at-least-once topic bus with consumer groups.
//!
//! Delivery semantics (broker-style):
//! - `publish` fans a message out to every consumer *group* subscribed to
//!   the topic; instances within a group compete for it.
//! - A consumer owns a `MessageLease` and must either `ack` or `fail`.
//!   `fail` schedules redelivery with exponential backoff until the retry
//!   budget is exhausted, then parks the message on the group's dead-letter
//!   list.
//! - Redelivery means at-least-once: handlers must be idempotent.
//!
//! Design intent:
//! - The bus manages delivery state transitions (Queued -> InFlight -> ...).
//! - The worker loop executes side effects and reports the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::BusError;
use crate::domain::event::Event;
use crate::domain::ids::MessageId;

/// Retry policy for failed deliveries.
///
/// Exponential backoff: delay = base_delay * multiplier^(attempts - 1).
/// After `max_attempts` failed attempts the message is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the first redelivery, in milliseconds.
    pub base_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Maximum delivery attempts (including the first).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next redelivery, given the attempts already made.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms).as_secs_f64();
        let delay = base * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay)
    }
}

/// What `fail` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Scheduled for redelivery after a backoff delay.
    Requeued { delay: Duration },

    /// Retry budget exhausted; parked on the dead-letter list.
    DeadLettered,
}

/// A message parked after exhausting its retry budget, kept for operator
/// inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub group: String,
    pub message_id: MessageId,
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempts: u32,
    pub parked_at: DateTime<Utc>,
}

/// Delivery counts across the bus, for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub queued: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
}

/// A leased message. The worker owns this lease and must `ack` or `fail`.
#[async_trait]
pub trait MessageLease: Send {
    fn message_id(&self) -> MessageId;

    fn payload(&self) -> &serde_json::Value;

    /// 1-indexed delivery attempt this lease represents.
    fn attempt(&self) -> u32;

    /// Mark success.
    async fn ack(self: Box<Self>) -> Result<(), BusError>;

    /// Mark failure; the bus decides between redelivery and dead-letter.
    async fn fail(self: Box<Self>, error: String) -> Result<FailDisposition, BusError>;
}

/// One consumer-group subscription. Cloning the `Arc` and leasing from
/// several tasks makes those tasks competing consumers.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Lease one message (waits until available; None once the bus shuts
    /// down).
    async fn lease(&self) -> Option<Box<dyn MessageLease>>;
}

/// Message bus port. In-memory in this repository; the trait is the seam
/// for a broker-backed implementation later.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic. Fire-and-forget: a topic without
    /// subscribers silently drops the message, like an unbound exchange.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError>;

    /// Join (or create) a consumer group on a topic.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Arc<dyn BusConsumer>, BusError>;

    /// Observability hook.
    async fn counts(&self) -> Result<DeliveryCounts, BusError>;

    /// Snapshot of all parked messages.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError>;
}

/// Typed publish on top of the raw port.
#[async_trait]
pub trait MessageBusExt: MessageBus {
    async fn publish_event<E: Event>(&self, event: &E) -> Result<(), BusError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| BusError::OperationFailed(format!("encode {}: {e}", E::TOPIC)))?;
        self.publish(E::TOPIC, payload).await
    }
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBusExt for T {}
