//! Completion sinks.
//!
//! `LogSink` is the default production sink (a structured log line per
//! completion). `RecordingSink` captures completions for assertions and lets
//! tests await them without polling loops.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::domain::event::AggregationCompleted;
use crate::ports::sink::CompletionSink;

/// Default sink: log and move on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl CompletionSink for LogSink {
    async fn notify(&self, completed: AggregationCompleted) -> Result<(), String> {
        info!(
            signal_id = %completed.signal_id,
            final_result = completed.final_result,
            "aggregation completed"
        );
        Ok(())
    }
}

/// Test sink that records every notification.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<AggregationCompleted>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn received(&self) -> Vec<AggregationCompleted> {
        self.received.lock().await.clone()
    }

    /// Wait until at least `n` notifications have arrived.
    ///
    /// Registers for wakeup before re-checking, so a notification landing
    /// between the check and the await is not lost.
    pub async fn wait_for(&self, n: usize) -> Vec<AggregationCompleted> {
        loop {
            let notified = self.notify.notified();
            {
                let received = self.received.lock().await;
                if received.len() >= n {
                    return received.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl CompletionSink for RecordingSink {
    async fn notify(&self, completed: AggregationCompleted) -> Result<(), String> {
        self.received.lock().await.push(completed);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    use crate::domain::ids::SignalId;

    fn completed(final_result: i64) -> AggregationCompleted {
        AggregationCompleted {
            signal_id: SignalId::generate(),
            final_result,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn recording_sink_wait_for_sees_late_notifications() {
        let sink = RecordingSink::new();

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for(2).await })
        };

        sink.notify(completed(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink.notify(completed(2)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("wait_for should resolve")
            .unwrap();
        assert_eq!(received.len(), 2);
    }
}
