//! In-memory aggregate store implementation.
//!
//! One async Mutex over the whole map: every operation is a single critical
//! section, which is exactly the atomic read-check-write the port contract
//! asks for. A SQL-backed implementation would replace the map lookup with a
//! unique constraint and the completion flip with a conditional UPDATE.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::aggregate::{Aggregate, CompletedAggregate, StoredPartial};
use crate::domain::errors::StoreError;
use crate::domain::event::PartialResult;
use crate::domain::ids::SignalId;
use crate::domain::strategy::AggregationStrategy;
use crate::ports::clock::Clock;
use crate::ports::store::{AggregateCounts, AggregateStore, InsertOutcome};

/// In-memory aggregate store.
///
/// The store owns the aggregation strategy: folding partials into the final
/// result must happen inside the completion critical section, so the
/// strategy has to be reachable from there.
pub struct MemoryAggregateStore {
    aggregates: Mutex<HashMap<SignalId, Aggregate>>,
    strategy: Arc<dyn AggregationStrategy>,
    clock: Arc<dyn Clock>,
}

impl MemoryAggregateStore {
    pub fn new(strategy: Arc<dyn AggregationStrategy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            aggregates: Mutex::new(HashMap::new()),
            strategy,
            clock,
        }
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn insert_partial(&self, result: &PartialResult) -> Result<InsertOutcome, StoreError> {
        let now = self.clock.now();
        let mut aggregates = self.aggregates.lock().await;

        let aggregate = aggregates
            .entry(result.signal_id)
            .or_insert_with(|| Aggregate::open(result.signal_id, now));

        // Uniqueness constraint on (signal_id, source)
        if aggregate.contains_source(&result.source) {
            debug!(
                signal_id = %result.signal_id,
                source = %result.source,
                "duplicate partial result ignored"
            );
            return Ok(InsertOutcome::AlreadyExists);
        }

        // processed_at is the producer's timestamp; the store clock only
        // dates the aggregate's first observation.
        aggregate.push_partial(StoredPartial {
            source: result.source.clone(),
            value: result.value,
            processed_at: result.timestamp,
        });

        Ok(InsertOutcome::Inserted {
            distinct_sources: aggregate.distinct_sources(),
        })
    }

    async fn try_complete(&self, id: SignalId) -> Result<Option<CompletedAggregate>, StoreError> {
        let mut aggregates = self.aggregates.lock().await;

        let Some(aggregate) = aggregates.get_mut(&id) else {
            return Ok(None);
        };
        if aggregate.is_complete {
            return Ok(None); // Lost the race (or a redelivered trigger)
        }

        let final_result = self.strategy.combine(&aggregate.values());
        aggregate.mark_complete(final_result);

        Ok(Some(CompletedAggregate {
            signal_id: id,
            final_result,
            distinct_sources: aggregate.distinct_sources(),
            completed_at: self.clock.now(),
        }))
    }

    async fn expired_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalId>, StoreError> {
        let aggregates = self.aggregates.lock().await;
        let mut candidates: Vec<(DateTime<Utc>, SignalId)> = aggregates
            .values()
            .filter(|agg| !agg.is_complete && agg.created_at < cutoff)
            .map(|agg| (agg.created_at, agg.id))
            .collect();
        candidates.sort();
        Ok(candidates.into_iter().map(|(_, id)| id).collect())
    }

    async fn get(&self, id: SignalId) -> Result<Option<Aggregate>, StoreError> {
        let aggregates = self.aggregates.lock().await;
        Ok(aggregates.get(&id).cloned())
    }

    async fn counts(&self) -> Result<AggregateCounts, StoreError> {
        let aggregates = self.aggregates.lock().await;
        let complete = aggregates.values().filter(|agg| agg.is_complete).count();
        Ok(AggregateCounts {
            open: aggregates.len() - complete,
            complete,
        })
    }
}

/// Test double that can be told to fail a number of upcoming operations.
///
/// Wraps a real store so successful calls behave normally. Used to verify
/// that store failures propagate as lease failures (and so get retried).
pub struct FaultyStore {
    inner: MemoryAggregateStore,
    failing_inserts: AtomicU32,
    failing_completes: AtomicU32,
}

impl FaultyStore {
    pub fn new(strategy: Arc<dyn AggregationStrategy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryAggregateStore::new(strategy, clock),
            failing_inserts: AtomicU32::new(0),
            failing_completes: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` insert_partial calls.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` try_complete calls.
    pub fn fail_next_completes(&self, n: u32) {
        self.failing_completes.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AggregateStore for FaultyStore {
    async fn insert_partial(&self, result: &PartialResult) -> Result<InsertOutcome, StoreError> {
        if Self::take_failure(&self.failing_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".into()));
        }
        self.inner.insert_partial(result).await
    }

    async fn try_complete(&self, id: SignalId) -> Result<Option<CompletedAggregate>, StoreError> {
        if Self::take_failure(&self.failing_completes) {
            return Err(StoreError::Unavailable("injected complete failure".into()));
        }
        self.inner.try_complete(id).await
    }

    async fn expired_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalId>, StoreError> {
        self.inner.expired_candidates(cutoff).await
    }

    async fn get(&self, id: SignalId) -> Result<Option<Aggregate>, StoreError> {
        self.inner.get(id).await
    }

    async fn counts(&self) -> Result<AggregateCounts, StoreError> {
        self.inner.counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    use crate::domain::ids::Source;
    use crate::domain::strategy::SumStrategy;
    use crate::ports::clock::{FixedClock, SystemClock};

    fn store() -> MemoryAggregateStore {
        MemoryAggregateStore::new(Arc::new(SumStrategy), Arc::new(SystemClock))
    }

    fn partial(signal_id: SignalId, source: &str, value: i64) -> PartialResult {
        PartialResult {
            signal_id,
            source: Source::new(source),
            value,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_insert_creates_the_aggregate_lazily() {
        let store = store();
        let id = SignalId::generate();

        let outcome = store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        assert_eq!(
            outcome,
            InsertOutcome::Inserted {
                distinct_sources: 1
            }
        );

        let agg = store.get(id).await.unwrap().unwrap();
        assert!(!agg.is_complete);
        assert_eq!(agg.values(), vec![4]);
    }

    #[tokio::test]
    async fn stored_partial_keeps_the_producer_timestamp() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = MemoryAggregateStore::new(Arc::new(SumStrategy), clock);
        let id = SignalId::generate();

        // The producer stamped this two minutes before the store saw it
        let produced_at = t0 - TimeDelta::seconds(120);
        let result = PartialResult {
            signal_id: id,
            source: Source::new("unit-a"),
            value: 4,
            timestamp: produced_at,
        };
        store.insert_partial(&result).await.unwrap();

        let agg = store.get(id).await.unwrap().unwrap();
        assert_eq!(agg.partials[0].processed_at, produced_at);
        assert_eq!(agg.created_at, t0);
    }

    #[tokio::test]
    async fn duplicate_source_is_reported_not_errored() {
        let store = store();
        let id = SignalId::generate();

        store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        let outcome = store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        assert_eq!(outcome, InsertOutcome::AlreadyExists);

        // The stored row is untouched
        let agg = store.get(id).await.unwrap().unwrap();
        assert_eq!(agg.distinct_sources(), 1);
    }

    #[tokio::test]
    async fn try_complete_folds_partials_with_the_strategy() {
        let store = store();
        let id = SignalId::generate();

        store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        store.insert_partial(&partial(id, "unit-b", 5)).await.unwrap();
        store.insert_partial(&partial(id, "unit-c", 1)).await.unwrap();

        let completed = store.try_complete(id).await.unwrap().unwrap();
        assert_eq!(completed.final_result, 10);
        assert_eq!(completed.distinct_sources, 3);
    }

    #[tokio::test]
    async fn second_try_complete_returns_none() {
        let store = store();
        let id = SignalId::generate();
        store.insert_partial(&partial(id, "unit-a", 7)).await.unwrap();

        assert!(store.try_complete(id).await.unwrap().is_some());
        assert!(store.try_complete(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_complete_on_unknown_signal_returns_none() {
        let store = store();
        assert!(store.try_complete(SignalId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn late_insert_after_completion_is_inert() {
        let store = store();
        let id = SignalId::generate();
        store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        store.insert_partial(&partial(id, "unit-b", 5)).await.unwrap();

        let completed = store.try_complete(id).await.unwrap().unwrap();
        assert_eq!(completed.final_result, 9);

        // A straggler arrives after the flip: stored, but never re-folded
        let outcome = store.insert_partial(&partial(id, "unit-c", 100)).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted { .. }));

        let agg = store.get(id).await.unwrap().unwrap();
        assert_eq!(agg.final_result, Some(9));
        assert!(store.try_complete(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_candidates_are_open_old_aggregates_oldest_first() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = MemoryAggregateStore::new(Arc::new(SumStrategy), clock.clone());

        let old = SignalId::generate();
        store.insert_partial(&partial(old, "unit-a", 1)).await.unwrap();

        clock.advance(TimeDelta::seconds(10));
        let older_complete = SignalId::generate();
        store
            .insert_partial(&partial(older_complete, "unit-a", 1))
            .await
            .unwrap();
        store.try_complete(older_complete).await.unwrap();

        clock.advance(TimeDelta::seconds(25));
        let fresh = SignalId::generate();
        store.insert_partial(&partial(fresh, "unit-a", 1)).await.unwrap();

        // Cutoff at t0+30s: only `old` is both open and old enough
        let cutoff = t0 + TimeDelta::seconds(30);
        let candidates = store.expired_candidates(cutoff).await.unwrap();
        assert_eq!(candidates, vec![old]);
    }

    #[tokio::test]
    async fn concurrent_duplicate_inserts_store_exactly_one_row() {
        let store = Arc::new(store());
        let id = SignalId::generate();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), InsertOutcome::Inserted { .. }) {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        let agg = store.get(id).await.unwrap().unwrap();
        assert_eq!(agg.distinct_sources(), 1);
    }

    #[tokio::test]
    async fn concurrent_try_complete_has_exactly_one_winner() {
        let store = Arc::new(store());
        let id = SignalId::generate();
        store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_complete(id).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn strategy_is_pluggable() {
        struct MaxStrategy;
        impl AggregationStrategy for MaxStrategy {
            fn combine(&self, values: &[i64]) -> i64 {
                values.iter().copied().max().unwrap_or(0)
            }
        }

        let store = MemoryAggregateStore::new(Arc::new(MaxStrategy), Arc::new(SystemClock));
        let id = SignalId::generate();
        store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        store.insert_partial(&partial(id, "unit-b", 9)).await.unwrap();

        let completed = store.try_complete(id).await.unwrap().unwrap();
        assert_eq!(completed.final_result, 9);
    }

    #[tokio::test]
    async fn faulty_store_fails_then_recovers() {
        let store = FaultyStore::new(Arc::new(SumStrategy), Arc::new(SystemClock));
        let id = SignalId::generate();

        store.fail_next_inserts(1);
        let err = store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        // Next call succeeds: the failure budget is spent
        let outcome = store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    }
}
