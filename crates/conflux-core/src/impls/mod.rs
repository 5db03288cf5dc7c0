//! Impls - ポートの具象実装
//!
//! すべて in-process 実装。外部ブローカーやデータベースに差し替える場合は
//! ここに実装を追加するだけで、app レイヤーは変更不要。

pub mod log_sink;
pub mod memory_bus;
pub mod memory_store;
pub mod sim_processor;

pub use log_sink::{LogSink, RecordingSink};
pub use memory_bus::InMemoryBus;
pub use memory_store::{FaultyStore, MemoryAggregateStore};
pub use sim_processor::SimulatedProcessor;
