//! App - パイプラインの組み立てと実行
//!
//! ports のトレイトと impls の実装を束ねて、fan-out / fan-in パイプラインを
//! 構成します。各ステージは `EventHandler` 実装 + `WorkerGroup` で動きます。

pub mod aggregator;
pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod failure_log;
pub mod ingress;
pub mod notifier;
pub mod processing;
pub mod reaper;
pub mod status;
pub mod worker;

pub use aggregator::Aggregator;
pub use builder::{BuildError, Pipeline, PipelineBuilder};
pub use config::PipelineConfig;
pub use dispatcher::Dispatcher;
pub use failure_log::{FailureLog, FailureLogEntry};
pub use ingress::SignalIngress;
pub use notifier::Notifier;
pub use processing::ProcessingWorker;
pub use reaper::TimeoutReaper;
pub use status::PipelineCounts;
pub use worker::{EventHandler, WorkerGroup};
