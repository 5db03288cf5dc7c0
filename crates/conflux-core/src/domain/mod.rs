//! Domain model (ids, events, the aggregate record, errors).
//!
//! - **ids**: strongly-typed identifiers (SignalId, MessageId, Source)
//! - **event**: bus message contracts with `const TOPIC`
//! - **aggregate**: the per-signal accumulation record and its transitions
//! - **strategy**: pluggable fold from partial values to the final result
//! - **errors**: layered error types (store / bus / pipeline)

pub mod aggregate;
pub mod errors;
pub mod event;
pub mod ids;
pub mod strategy;

pub use aggregate::{Aggregate, CompletedAggregate, StoredPartial};
pub use errors::{BusError, PipelineError, StoreError};
pub use event::{
    AggregationCompleted, Event, FanOutTrigger, PartialResult, ProcessFailed, SignalReceived,
};
pub use ids::{MessageId, SignalId, Source};
pub use strategy::{AggregationStrategy, SumStrategy};
