//! Error types, split by layer.
//!
//! The taxonomy separates business outcomes from infrastructure faults:
//! a duplicate partial result is NOT an error (the store reports it as a
//! tagged `InsertOutcome`), while an unreachable store or bus is an error
//! that must propagate so the bus redelivers the message later.

use thiserror::Error;

use super::ids::SignalId;

/// Faults from the aggregation store.
///
/// Uniqueness violations are deliberately absent: they are an expected
/// business outcome and surface as `InsertOutcome::AlreadyExists` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("aggregation store unavailable: {0}")]
    Unavailable(String),
}

/// Faults from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is shut down")]
    ShutDown,

    #[error("bus operation failed: {0}")]
    OperationFailed(String),
}

/// Top-level processing error for consumer handlers.
///
/// Returning this from a handler fails the message lease, which schedules
/// redelivery with backoff until the retry budget is exhausted, then parks
/// the message on the dead-letter list.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("processor {name} failed for {signal_id}: {reason}")]
    Processor {
        name: String,
        signal_id: SignalId,
        reason: String,
    },

    #[error("completion sink failed: {0}")]
    Sink(String),

    #[error("event decode failed on topic {topic}: {source}")]
    Decode {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid signal data: {0}")]
    InvalidSignal(String),
}
