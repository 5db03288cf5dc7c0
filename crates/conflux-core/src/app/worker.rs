//! Generic consumer worker loop.
//!
//! 責務の分離:
//! - bus: 配送状態の管理（lease / ack / fail / retry / dead-letter）
//! - worker loop: デコードとハンドラ実行、結果の報告
//! - handler: ドメインロジック
//!
//! One loop serves every stage of the pipeline; stages differ only in the
//! event type and the `EventHandler` implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::errors::PipelineError;
use crate::domain::event::Event;
use crate::ports::bus::{BusConsumer, FailDisposition, MessageLease};

/// Typed handler for one event kind.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E) -> Result<(), PipelineError>;

    /// Called once when a delivery exhausts its retry budget. The default
    /// does nothing; stages that publish a failure event override this.
    async fn on_dead_letter(&self, event: E, error: &PipelineError) {
        let _ = (event, error);
    }
}

/// A set of identical consumer tasks on one consumer group.
pub struct WorkerGroup {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `instances` competing consumers running `handler`.
    pub fn spawn<E, H>(
        name: impl Into<String>,
        instances: usize,
        consumer: Arc<dyn BusConsumer>,
        handler: Arc<H>,
    ) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..instances)
            .map(|index| {
                let worker = format!("{name}-{index}");
                let consumer = Arc::clone(&consumer);
                let handler = Arc::clone(&handler);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(worker_loop::<E, H>(worker, consumer, handler, shutdown_rx))
            })
            .collect();

        Self {
            name,
            shutdown_tx,
            handles,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for every worker task to exit.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(group = %self.name, error = %e, "worker task panicked");
            }
        }
    }
}

async fn worker_loop<E, H>(
    worker: String,
    consumer: Arc<dyn BusConsumer>,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    E: Event,
    H: EventHandler<E> + 'static,
{
    debug!(%worker, topic = E::TOPIC, "worker started");
    loop {
        let lease = tokio::select! {
            lease = consumer.lease() => lease,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(lease) = lease else {
            break; // bus shut down
        };

        handle_delivery::<E, H>(&worker, lease, &handler).await;
    }
    debug!(%worker, topic = E::TOPIC, "worker stopped");
}

async fn handle_delivery<E, H>(worker: &str, lease: Box<dyn MessageLease>, handler: &Arc<H>)
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    let event: E = match serde_json::from_value(lease.payload().clone()) {
        Ok(event) => event,
        Err(source) => {
            // An undecodable payload will never decode; let the retry
            // budget run out and park it for inspection.
            let decode = PipelineError::Decode {
                topic: E::TOPIC,
                source,
            };
            warn!(%worker, error = %decode, "payload decode failed");
            if let Err(e) = lease.fail(decode.to_string()).await {
                error!(%worker, error = %e, "failed to fail lease");
            }
            return;
        }
    };

    let message_id = lease.message_id();
    let attempt = lease.attempt();

    match handler.handle(event.clone()).await {
        Ok(()) => {
            if let Err(e) = lease.ack().await {
                error!(%worker, %message_id, error = %e, "ack failed");
            }
        }
        Err(handle_error) => {
            warn!(
                %worker,
                %message_id,
                attempt,
                error = %handle_error,
                "handler failed"
            );
            match lease.fail(handle_error.to_string()).await {
                Ok(FailDisposition::Requeued { delay }) => {
                    debug!(%worker, %message_id, ?delay, "redelivery scheduled");
                }
                Ok(FailDisposition::DeadLettered) => {
                    error!(%worker, %message_id, attempt, "message dead-lettered");
                    handler.on_dead_letter(event, &handle_error).await;
                }
                Err(e) => {
                    error!(%worker, %message_id, error = %e, "failed to fail lease");
                }
            }
        }
    }
}
