//! Pipeline assembly.
//!
//! # 設計方針
//! - Builder パターンで宣言的に構成
//! - 起動前検証（fail fast）: 重複 unit 名や不足する unit 数は build() で
//!   エラーにする
//! - build() がすべての購読・ワーカー起動・reaper 起動を行う
//!
//! Wiring (topic -> consumer groups):
//! - signal.received -> "dispatcher"
//! - signal.fanout   -> one group per processing-unit identity
//! - signal.partial  -> "aggregator"
//! - signal.completed -> "notifications"
//! - signal.failed   -> "failure-log"

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::domain::aggregate::Aggregate;
use crate::domain::errors::{BusError, PipelineError};
use crate::domain::event::{
    AggregationCompleted, Event, FanOutTrigger, PartialResult, ProcessFailed, SignalReceived,
};
use crate::domain::ids::SignalId;
use crate::domain::strategy::{AggregationStrategy, SumStrategy};
use crate::impls::log_sink::LogSink;
use crate::impls::memory_bus::InMemoryBus;
use crate::impls::memory_store::MemoryAggregateStore;
use crate::ports::bus::{DeadLetter, MessageBus};
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::processor::ProcessingUnit;
use crate::ports::sink::CompletionSink;
use crate::ports::store::AggregateStore;

use super::aggregator::Aggregator;
use super::config::PipelineConfig;
use super::dispatcher::Dispatcher;
use super::failure_log::{FailureLog, FailureLogEntry};
use super::ingress::SignalIngress;
use super::notifier::Notifier;
use super::processing::ProcessingWorker;
use super::reaper::TimeoutReaper;
use super::status::PipelineCounts;
use super::worker::WorkerGroup;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate processing unit name: {name}")]
    DuplicateUnit { name: String },

    #[error("{have} processing unit(s) registered but {need} expected results configured")]
    NotEnoughUnits { have: usize, need: usize },

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    units: Vec<Arc<dyn ProcessingUnit>>,
    unit_instances: usize,
    aggregator_instances: usize,
    sink: Arc<dyn CompletionSink>,
    strategy: Arc<dyn AggregationStrategy>,
    clock: Arc<dyn Clock>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            units: Vec::new(),
            unit_instances: 1,
            aggregator_instances: 2,
            sink: Arc::new(LogSink),
            strategy: Arc::new(SumStrategy),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn register_unit(mut self, unit: Arc<dyn ProcessingUnit>) -> Self {
        self.units.push(unit);
        self
    }

    /// Competing consumer instances per processing-unit identity.
    pub fn unit_instances(mut self, instances: usize) -> Self {
        self.unit_instances = instances.max(1);
        self
    }

    /// Competing aggregator instances. More than one exercises the
    /// completion race on every signal.
    pub fn aggregator_instances(mut self, instances: usize) -> Self {
        self.aggregator_instances = instances.max(1);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        let mut seen = HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.name().to_string()) {
                return Err(BuildError::DuplicateUnit {
                    name: unit.name().to_string(),
                });
            }
        }
        if self.units.len() < self.config.expected_results {
            return Err(BuildError::NotEnoughUnits {
                have: self.units.len(),
                need: self.config.expected_results,
            });
        }
        Ok(())
    }

    /// Validate, wire every stage to the bus, and start all workers.
    pub async fn build(self) -> Result<Pipeline, BuildError> {
        self.validate()?;

        let bus = Arc::new(InMemoryBus::new(self.config.retry.clone()));
        let store: Arc<dyn AggregateStore> = Arc::new(MemoryAggregateStore::new(
            self.strategy,
            self.clock.clone(),
        ));
        let failure_log = FailureLog::new();

        let mut groups = Vec::new();

        let consumer = bus.subscribe(SignalReceived::TOPIC, "dispatcher").await?;
        groups.push(WorkerGroup::spawn::<SignalReceived, _>(
            "dispatcher",
            1,
            consumer,
            Arc::new(Dispatcher::new(bus.clone())),
        ));

        for unit in &self.units {
            let consumer = bus.subscribe(FanOutTrigger::TOPIC, unit.name()).await?;
            groups.push(WorkerGroup::spawn::<FanOutTrigger, _>(
                unit.name(),
                self.unit_instances,
                consumer,
                Arc::new(ProcessingWorker::new(
                    unit.clone(),
                    bus.clone(),
                    self.clock.clone(),
                )),
            ));
        }

        let consumer = bus.subscribe(PartialResult::TOPIC, "aggregator").await?;
        groups.push(WorkerGroup::spawn::<PartialResult, _>(
            "aggregator",
            self.aggregator_instances,
            consumer,
            Arc::new(Aggregator::new(
                store.clone(),
                bus.clone(),
                self.config.expected_results,
            )),
        ));

        let consumer = bus
            .subscribe(AggregationCompleted::TOPIC, "notifications")
            .await?;
        groups.push(WorkerGroup::spawn::<AggregationCompleted, _>(
            "notifications",
            1,
            consumer,
            Arc::new(Notifier::new(self.sink)),
        ));

        let consumer = bus.subscribe(ProcessFailed::TOPIC, "failure-log").await?;
        groups.push(WorkerGroup::spawn::<ProcessFailed, _>(
            "failure-log",
            1,
            consumer,
            failure_log.clone(),
        ));

        let (reaper_shutdown_tx, reaper_shutdown_rx) = watch::channel(false);
        let reaper = Arc::new(TimeoutReaper::new(
            store.clone(),
            bus.clone(),
            self.clock.clone(),
            &self.config,
        ));
        let reaper_handle = reaper.spawn(reaper_shutdown_rx);

        info!(
            units = self.units.len(),
            expected_results = self.config.expected_results,
            timeout_secs = self.config.timeout_secs,
            "pipeline started"
        );

        Ok(Pipeline {
            ingress: SignalIngress::new(bus.clone(), self.clock),
            bus,
            store,
            failure_log,
            groups,
            reaper_shutdown_tx,
            reaper_handle,
        })
    }
}

/// A running pipeline.
pub struct Pipeline {
    ingress: SignalIngress,
    bus: Arc<InMemoryBus>,
    store: Arc<dyn AggregateStore>,
    failure_log: Arc<FailureLog>,
    groups: Vec<WorkerGroup>,
    reaper_shutdown_tx: watch::Sender<bool>,
    reaper_handle: JoinHandle<()>,
}

impl Pipeline {
    /// Submit one raw signal. Returns its assigned id.
    pub async fn submit(&self, raw: &str) -> Result<SignalId, PipelineError> {
        self.ingress.submit(raw).await
    }

    pub async fn aggregate(&self, id: SignalId) -> Result<Option<Aggregate>, PipelineError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn counts(&self) -> Result<PipelineCounts, PipelineError> {
        let aggregates = self.store.counts().await?;
        let delivery = self.bus.counts().await?;
        let dead_letters = delivery.dead;
        Ok(PipelineCounts {
            aggregates,
            delivery,
            dead_letters,
        })
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PipelineError> {
        Ok(self.bus.dead_letters().await?)
    }

    pub async fn failure_log(&self) -> Vec<FailureLogEntry> {
        self.failure_log.entries().await
    }

    /// Stop the reaper and all workers, then wait for them to exit.
    /// In-flight leases finish their ack/fail first.
    pub async fn shutdown_and_join(self) {
        let _ = self.reaper_shutdown_tx.send(true);
        if let Err(e) = self.reaper_handle.await {
            error!(error = %e, "reaper task panicked");
        }

        self.bus.shutdown();
        for group in self.groups {
            group.shutdown_and_join().await;
        }
        info!("pipeline stopped");
    }
}
