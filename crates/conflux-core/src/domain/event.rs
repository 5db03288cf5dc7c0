//! Bus events: the message contracts between pipeline stages.
//!
//! Each event type carries a `const TOPIC` so the type system, not a string
//! at the call site, decides where a message goes. The payload travels as
//! JSON on the bus and is decoded back into the typed event by the consumer.
//!
//! # Trait Bounds
//! - `Serialize` / `DeserializeOwned`: the bus stores JSON payloads
//! - `Clone`: consumers may need the event again after a failed handle
//!   (dead-letter hook)
//! - `Send + Sync + 'static`: events cross worker tasks

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::{SignalId, Source};

/// An event with a fixed bus topic.
///
/// # 命名規約
/// - `{namespace}.{domain}.{action}.v{major}`
/// - 例: `conflux.signal.received.v1`
pub trait Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;
}

/// Produced by the ingress boundary once a raw submission has been validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReceived {
    pub signal_id: SignalId,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

impl Event for SignalReceived {
    const TOPIC: &'static str = "conflux.signal.received.v1";
}

/// Produced by the dispatcher, exactly once per signal.
///
/// Consumed by every processing-unit identity (one consumer group each);
/// instances within an identity compete for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutTrigger {
    pub signal_id: SignalId,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

impl Event for FanOutTrigger {
    const TOPIC: &'static str = "conflux.signal.fanout.v1";
}

/// One contribution toward an aggregate, attributed to a named source.
///
/// Delivery is at-least-once: the aggregator must treat redelivery of the
/// same `(signal_id, source)` pair as a successful no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub signal_id: SignalId,
    pub source: Source,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

impl Event for PartialResult {
    const TOPIC: &'static str = "conflux.signal.partial.v1";
}

/// Published exactly once per signal, by whichever of the aggregator or the
/// timeout reaper wins the completion compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationCompleted {
    pub signal_id: SignalId,
    pub final_result: i64,
    pub timestamp: DateTime<Utc>,
}

impl Event for AggregationCompleted {
    const TOPIC: &'static str = "conflux.signal.completed.v1";
}

/// Published when a processing unit exhausts its redelivery budget for a
/// signal. The signal may still complete partially via the timeout reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessFailed {
    pub signal_id: SignalId,
    pub source: Source,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl Event for ProcessFailed {
    const TOPIC: &'static str = "conflux.signal.failed.v1";
}
