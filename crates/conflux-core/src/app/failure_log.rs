//! Failure log: durable record of exhausted processing attempts.
//!
//! Consumes `ProcessFailed` and appends an entry per failure. Appending the
//! same failure twice (redelivery) just produces two entries; the log is an
//! audit trail, not a coordination point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::errors::PipelineError;
use crate::domain::event::ProcessFailed;
use crate::domain::ids::{SignalId, Source};

use super::worker::EventHandler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLogEntry {
    pub signal_id: SignalId,
    pub source: Source,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// In-memory append-only failure log.
#[derive(Default)]
pub struct FailureLog {
    entries: Mutex<Vec<FailureLogEntry>>,
}

impl FailureLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn entries(&self) -> Vec<FailureLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler<ProcessFailed> for FailureLog {
    async fn handle(&self, event: ProcessFailed) -> Result<(), PipelineError> {
        warn!(
            signal_id = %event.signal_id,
            source = %event.source,
            reason = %event.reason,
            "processing permanently failed"
        );
        self.entries.lock().await.push(FailureLogEntry {
            signal_id: event.signal_id,
            source: event.source,
            reason: event.reason,
            occurred_at: event.timestamp,
        });
        Ok(())
    }
}
