//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（message broker, database, notification
//! channel など）へのインターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - AggregateStore が coordination の正本（uniqueness + compare-and-set）
//! - MessageBus は at-least-once 配送（retry / dead-letter 付き）
//! - Clock は差し替え可能（テストでは FixedClock）

pub mod bus;
pub mod clock;
pub mod processor;
pub mod sink;
pub mod store;

pub use bus::{
    BusConsumer, DeadLetter, DeliveryCounts, FailDisposition, MessageBus, MessageBusExt,
    MessageLease, RetryPolicy,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use processor::ProcessingUnit;
pub use sink::CompletionSink;
pub use store::{AggregateCounts, AggregateStore, InsertOutcome};
