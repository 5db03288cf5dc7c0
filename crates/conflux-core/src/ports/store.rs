//! AggregateStore port - the single shared mutable resource.
//!
//! # 設計原則
//! - すべての mutation は atomic read-check-write（または constraint-checked
//!   insert）として表現する。分散ロックは使わない。
//! - 重複検出は tagged outcome（Inserted / AlreadyExists）で返す。
//!   uniqueness violation は例外ではなく期待される結果。
//! - 完了判定と final result の計算は同一の compare-and-set 内で行う。
//!
//! Every cross-instance coordination in the pipeline is mediated here: the
//! uniqueness constraint on `(signal_id, source)` makes concurrent duplicate
//! writers safe, and the compare-and-set on `is_complete` makes the
//! aggregator and the timeout reaper race-safe without talking to each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::aggregate::{Aggregate, CompletedAggregate};
use crate::domain::errors::StoreError;
use crate::domain::event::PartialResult;
use crate::domain::ids::SignalId;

/// Result of a constraint-checked partial-result insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was stored; `distinct_sources` is the count after this
    /// insert.
    Inserted { distinct_sources: usize },

    /// A row for this `(signal_id, source)` pair already exists. This is a
    /// successful no-op, not an error.
    AlreadyExists,
}

/// Aggregate counts, for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub open: usize,
    pub complete: usize,
}

/// Durable keyed store: one aggregate record per signal id.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Insert one partial result, creating the aggregate lazily on first
    /// contact with an unseen signal id.
    ///
    /// Enforces at most one row per `(signal_id, source)` as a hard
    /// constraint; a violated constraint maps to `AlreadyExists`, never to
    /// an error. An insert into an already-complete aggregate stores the
    /// row as an inert tail: it never changes `final_result` and never
    /// re-triggers completion.
    async fn insert_partial(&self, result: &PartialResult) -> Result<InsertOutcome, StoreError>;

    /// Compare-and-set completion: atomically, if the aggregate exists and
    /// is still open, fold the partials present right now into the final
    /// result, flip `is_complete`, and return the summary. Returns `None`
    /// when the aggregate is absent or already complete.
    ///
    /// Both natural (K-th result) and forced (timeout) completion go
    /// through this single path, so at most one caller ever receives
    /// `Some` per signal.
    async fn try_complete(&self, id: SignalId) -> Result<Option<CompletedAggregate>, StoreError>;

    /// Open aggregates first observed before `cutoff`, oldest first.
    async fn expired_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalId>, StoreError>;

    /// Read one aggregate, for status queries and tests.
    async fn get(&self, id: SignalId) -> Result<Option<Aggregate>, StoreError>;

    /// Observability hook.
    async fn counts(&self) -> Result<AggregateCounts, StoreError>;
}
