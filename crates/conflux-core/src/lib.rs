//! conflux-core - fan-out / fan-in signal aggregation pipeline
//!
//! 非同期メッセージバス上の並列処理パイプライン:
//! 1 つの入力シグナルを K 個の processing unit に fan-out し、
//! 各 unit の partial result を冪等な aggregator で fan-in します。
//! timeout reaper が停滞した集約を強制完了させます。
//!
//! # Architecture
//!
//! ```text
//! submit -> [ingress] -> signal.received -> [dispatcher] -> signal.fanout
//!                                                             |  (fan-out)
//!                                    +------------------------+-----------+
//!                                    v                        v           v
//!                                [unit-a]                 [unit-b]    [unit-c]
//!                                    |                        |           |
//!                                    +-----> signal.partial <-+-----------+
//!                                                 |  (fan-in, at-least-once)
//!                                            [aggregator] ---+
//!                                                 |          | compare-and-set
//!                                            [reaper] -------+
//!                                                 |
//!                                         signal.completed -> [sink]
//! ```
//!
//! # Layers
//! - `domain`: events, ids, the aggregate record, strategies, errors
//! - `ports`: traits for the bus, store, clock, processing units, sink
//! - `impls`: in-memory implementations of the ports
//! - `app`: handlers per stage, worker loops, the builder, the reaper
//!
//! # Delivery semantics
//! The bus is at-least-once. Every consumer is idempotent or tolerant of
//! duplicates: the aggregator dedups on `(signal_id, source)`, completion
//! is a compare-and-set that at most one caller wins, and the sink accepts
//! duplicate notifications.

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Pipeline, PipelineBuilder, PipelineConfig};
pub use domain::errors::PipelineError;
pub use domain::ids::{SignalId, Source};
