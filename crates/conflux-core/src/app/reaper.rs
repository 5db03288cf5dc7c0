//! Timeout reaper: forces completion of stuck aggregates.
//!
//! Periodically sweeps for open aggregates older than the timeout and
//! completes them with whatever partials have arrived. The force path goes
//! through the same store compare-and-set as the natural path, so a race
//! between the reaper and a just-arrived K-th partial still yields exactly
//! one `AggregationCompleted`.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::PipelineConfig;
use crate::domain::errors::PipelineError;
use crate::domain::event::AggregationCompleted;
use crate::domain::ids::SignalId;
use crate::ports::bus::{MessageBus, MessageBusExt};
use crate::ports::clock::Clock;
use crate::ports::store::AggregateStore;

pub struct TimeoutReaper {
    store: Arc<dyn AggregateStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    timeout: TimeDelta,
    sweep_interval: Duration,
}

impl TimeoutReaper {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            timeout: TimeDelta::seconds(config.timeout_secs as i64),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
        }
    }

    /// One sweep: force-complete every expired open aggregate. Returns how
    /// many aggregates this sweep actually completed.
    ///
    /// A failure on one candidate is logged and skipped; the rest of the
    /// sweep continues, and the candidate stays eligible for the next one.
    pub async fn sweep(&self) -> Result<usize, PipelineError> {
        let cutoff = self.clock.now() - self.timeout;
        let candidates = self.store.expired_candidates(cutoff).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        debug!(candidates = candidates.len(), %cutoff, "sweeping expired aggregates");
        let mut forced = 0;
        for id in candidates {
            match self.force_complete(id).await {
                Ok(true) => forced += 1,
                Ok(false) => {} // lost the race to a natural completion
                Err(e) => {
                    warn!(signal_id = %id, error = %e, "forced completion failed, will retry next sweep");
                }
            }
        }
        Ok(forced)
    }

    async fn force_complete(&self, id: SignalId) -> Result<bool, PipelineError> {
        let Some(completed) = self.store.try_complete(id).await? else {
            return Ok(false);
        };

        info!(
            signal_id = %completed.signal_id,
            final_result = completed.final_result,
            distinct_sources = completed.distinct_sources,
            "aggregation force-completed after timeout"
        );
        self.bus
            .publish_event(&AggregationCompleted {
                signal_id: completed.signal_id,
                final_result: completed.final_result,
                timestamp: completed.completed_at,
            })
            .await?;
        Ok(true)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval = ?self.sweep_interval, "timeout reaper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.sweep_interval) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "sweep failed");
                }
            }
            debug!("timeout reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    use crate::domain::event::{Event, PartialResult};
    use crate::domain::ids::Source;
    use crate::domain::strategy::SumStrategy;
    use crate::impls::memory_bus::InMemoryBus;
    use crate::impls::memory_store::MemoryAggregateStore;
    use crate::ports::bus::{BusConsumer, RetryPolicy};
    use crate::ports::clock::FixedClock;

    fn partial(signal_id: SignalId, source: &str, value: i64) -> PartialResult {
        PartialResult {
            signal_id,
            source: Source::new(source),
            value,
            timestamp: Utc::now(),
        }
    }

    struct Fixture {
        store: Arc<MemoryAggregateStore>,
        clock: Arc<FixedClock>,
        reaper: TimeoutReaper,
        probe: Arc<dyn BusConsumer>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(MemoryAggregateStore::new(Arc::new(SumStrategy), clock.clone()));
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::default()));
        let probe = bus
            .subscribe(AggregationCompleted::TOPIC, "probe")
            .await
            .unwrap();
        let reaper = TimeoutReaper::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            &PipelineConfig::default(), // 30s timeout
        );
        Fixture {
            store,
            clock,
            reaper,
            probe,
        }
    }

    async fn completed_events(probe: &Arc<dyn BusConsumer>) -> Vec<AggregationCompleted> {
        let mut events = Vec::new();
        while let Ok(Some(lease)) = timeout(StdDuration::from_millis(50), probe.lease()).await {
            events.push(serde_json::from_value(lease.payload().clone()).unwrap());
            lease.ack().await.unwrap();
        }
        events
    }

    #[tokio::test]
    async fn expired_aggregate_is_completed_with_partial_data() {
        let f = fixture().await;
        let id = SignalId::generate();

        // Two of three units reported, then the signal went quiet
        f.store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        f.store.insert_partial(&partial(id, "unit-b", 5)).await.unwrap();

        f.clock.advance(TimeDelta::seconds(31));
        let forced = f.reaper.sweep().await.unwrap();
        assert_eq!(forced, 1);

        let events = completed_events(&f.probe).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].final_result, 9);

        // A straggler arriving after the forced completion changes nothing
        f.store.insert_partial(&partial(id, "unit-c", 100)).await.unwrap();
        assert!(f.store.try_complete(id).await.unwrap().is_none());
        let agg = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(agg.final_result, Some(9));
    }

    #[tokio::test]
    async fn fresh_aggregates_are_left_alone() {
        let f = fixture().await;
        let id = SignalId::generate();
        f.store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();

        f.clock.advance(TimeDelta::seconds(10)); // under the 30s timeout
        assert_eq!(f.reaper.sweep().await.unwrap(), 0);
        assert!(completed_events(&f.probe).await.is_empty());
        assert!(!f.store.get(id).await.unwrap().unwrap().is_complete);
    }

    #[tokio::test]
    async fn losing_the_race_to_natural_completion_is_quiet() {
        let f = fixture().await;
        let id = SignalId::generate();
        f.store.insert_partial(&partial(id, "unit-a", 4)).await.unwrap();
        f.clock.advance(TimeDelta::seconds(31));

        // Natural completion lands between candidate listing and the sweep's
        // compare-and-set; simulate by completing first.
        f.store.try_complete(id).await.unwrap().unwrap();

        assert_eq!(f.reaper.sweep().await.unwrap(), 0);
        assert!(completed_events(&f.probe).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_completes_multiple_expired_aggregates_oldest_first() {
        let f = fixture().await;

        let first = SignalId::generate();
        f.store.insert_partial(&partial(first, "unit-a", 1)).await.unwrap();
        f.clock.advance(TimeDelta::seconds(5));
        let second = SignalId::generate();
        f.store.insert_partial(&partial(second, "unit-a", 2)).await.unwrap();

        f.clock.advance(TimeDelta::seconds(31));
        assert_eq!(f.reaper.sweep().await.unwrap(), 2);

        let events = completed_events(&f.probe).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].signal_id, first);
        assert_eq!(events[1].signal_id, second);
    }
}
