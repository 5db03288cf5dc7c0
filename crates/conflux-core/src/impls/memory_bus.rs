//! In-memory message bus implementation.
//!
//! Broker semantics without a broker: every consumer group subscribed to a
//! topic gets its own delivery queue, so one publish fans out across groups
//! while instances inside a group compete. Failed deliveries go through a
//! backoff schedule and end up dead-lettered once the retry budget runs out.
//!
//! Development/test transport; the `MessageBus` port is the seam for a real
//! broker later.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};

use crate::domain::errors::BusError;
use crate::domain::ids::MessageId;
use crate::ports::bus::{
    BusConsumer, DeadLetter, DeliveryCounts, FailDisposition, MessageBus, MessageLease,
    RetryPolicy,
};

/// Delivery state of one message within one consumer group.
///
/// State transitions:
/// - Queued -> InFlight -> Acked
/// - Queued -> InFlight -> RetryScheduled -> Queued (loop until max_attempts)
/// - Queued -> InFlight -> Dead (when max_attempts exceeded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Queued,
    InFlight,
    Acked,
    RetryScheduled,
    Dead,
}

/// Per-group metadata + payload for one message.
#[derive(Debug, Clone)]
struct MessageRecord {
    payload: serde_json::Value,
    state: DeliveryState,

    /// Delivery attempts made (including the current one if InFlight).
    attempts: u32,
    max_attempts: u32,

    last_error: Option<String>,

    /// When to redeliver (RetryScheduled state).
    next_run_at: Option<Instant>,
}

impl MessageRecord {
    fn new(payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            payload,
            state: DeliveryState::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_run_at: None,
        }
    }

    fn start_attempt(&mut self) {
        self.state = DeliveryState::InFlight;
        self.attempts += 1;
    }

    fn mark_acked(&mut self) {
        self.state = DeliveryState::Acked;
    }

    fn mark_dead(&mut self, error: String) {
        self.state = DeliveryState::Dead;
        self.last_error = Some(error);
    }

    fn schedule_retry(&mut self, next_run_at: Instant, error: String) {
        self.state = DeliveryState::RetryScheduled;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
    }

    fn requeue(&mut self) {
        self.state = DeliveryState::Queued;
        self.next_run_at = None;
    }
}

/// Scheduled redelivery entry for the backoff heap.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest
/// first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledDelivery {
    next_run_at: Instant,
    message_id: MessageId,
}

impl PartialOrd for ScheduledDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDelivery {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other.next_run_at.cmp(&self.next_run_at)
    }
}

/// Mutable state of one consumer group's queue.
struct GroupState {
    /// All message records seen by this group (single source of truth).
    records: HashMap<MessageId, MessageRecord>,

    /// Ready queue (MessageIds only).
    ready: VecDeque<MessageId>,

    /// Redelivery schedule (retry backoff).
    scheduled: BinaryHeap<ScheduledDelivery>,

    /// Parked messages, kept for operator inspection.
    dead: Vec<DeadLetter>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            dead: Vec::new(),
        }
    }

    /// Move messages from scheduled to ready if their time has come.
    fn promote_scheduled(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break; // Heap is sorted, so we can stop
            }

            let entry = self.scheduled.pop().expect("peeked entry exists");
            if let Some(record) = self.records.get_mut(&entry.message_id)
                && record.state == DeliveryState::RetryScheduled
            {
                record.requeue();
                self.ready.push_back(entry.message_id);
            }
        }
    }
}

/// One consumer group: a queue plus a wakeup handle.
struct Group {
    topic: String,
    name: String,
    state: Mutex<GroupState>,
    notify: Notify,
}

/// In-memory message bus.
pub struct InMemoryBus {
    /// topic -> subscribed groups.
    groups: Mutex<HashMap<String, Vec<Arc<Group>>>>,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InMemoryBus {
    pub fn new(retry: RetryPolicy) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            groups: Mutex::new(HashMap::new()),
            retry,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Stop issuing leases. Waiting consumers return None; in-flight leases
    /// can still ack/fail.
    pub fn shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        if *self.shutdown_rx.borrow() {
            return Err(BusError::ShutDown);
        }

        let targets: Vec<Arc<Group>> = {
            let groups = self.groups.lock().await;
            groups.get(topic).cloned().unwrap_or_default()
        };

        // One message id per publish, shared across groups (correlation).
        let message_id = MessageId::generate();
        for group in targets {
            {
                let mut state = group.state.lock().await;
                state.records.insert(
                    message_id,
                    MessageRecord::new(payload.clone(), self.retry.max_attempts),
                );
                state.ready.push_back(message_id);
            }
            group.notify.notify_one();
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Arc<dyn BusConsumer>, BusError> {
        let mut groups = self.groups.lock().await;
        let topic_groups = groups.entry(topic.to_string()).or_default();

        let shared = match topic_groups.iter().find(|g| g.name == group) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = Arc::new(Group {
                    topic: topic.to_string(),
                    name: group.to_string(),
                    state: Mutex::new(GroupState::new()),
                    notify: Notify::new(),
                });
                topic_groups.push(Arc::clone(&created));
                created
            }
        };

        Ok(Arc::new(GroupConsumer {
            group: shared,
            retry: self.retry.clone(),
            shutdown: self.shutdown_rx.clone(),
        }))
    }

    async fn counts(&self) -> Result<DeliveryCounts, BusError> {
        let mut counts = DeliveryCounts::default();
        let targets: Vec<Arc<Group>> = {
            let groups = self.groups.lock().await;
            groups.values().flatten().cloned().collect()
        };
        for group in targets {
            let state = group.state.lock().await;
            for record in state.records.values() {
                match record.state {
                    DeliveryState::Queued => counts.queued += 1,
                    DeliveryState::InFlight => counts.in_flight += 1,
                    DeliveryState::Acked => counts.acked += 1,
                    DeliveryState::RetryScheduled => counts.retry_scheduled += 1,
                    DeliveryState::Dead => counts.dead += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError> {
        let mut parked = Vec::new();
        let targets: Vec<Arc<Group>> = {
            let groups = self.groups.lock().await;
            groups.values().flatten().cloned().collect()
        };
        for group in targets {
            let state = group.state.lock().await;
            parked.extend(state.dead.iter().cloned());
        }
        Ok(parked)
    }
}

/// Competitive consumer handle for one group.
struct GroupConsumer {
    group: Arc<Group>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl BusConsumer for GroupConsumer {
    async fn lease(&self) -> Option<Box<dyn MessageLease>> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let next_wake = {
                let mut state = self.group.state.lock().await;
                state.promote_scheduled();

                if let Some(message_id) = state.ready.pop_front()
                    && let Some(record) = state.records.get_mut(&message_id)
                {
                    record.start_attempt();
                    let lease = InMemoryLease {
                        message_id,
                        payload: record.payload.clone(),
                        attempt: record.attempts,
                        group: Arc::clone(&self.group),
                        retry: self.retry.clone(),
                    };
                    return Some(Box::new(lease));
                }

                // No ready messages - maybe some are scheduled for later
                state.scheduled.peek().map(|entry| entry.next_run_at)
            };

            // Wait for a publish/requeue notification, the next scheduled
            // redelivery, or shutdown - whichever comes first.
            if let Some(wake_time) = next_wake {
                tokio::select! {
                    _ = self.group.notify.notified() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            return None;
                        }
                    }
                    _ = tokio::time::sleep_until(wake_time.into()) => {}
                }
            } else {
                tokio::select! {
                    _ = self.group.notify.notified() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Lease implementation for the in-memory bus.
struct InMemoryLease {
    message_id: MessageId,
    payload: serde_json::Value,
    attempt: u32,
    group: Arc<Group>,
    retry: RetryPolicy,
}

#[async_trait]
impl MessageLease for InMemoryLease {
    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.group.state.lock().await;
        let Some(record) = state.records.get_mut(&self.message_id) else {
            return Err(BusError::OperationFailed(format!(
                "no record for {}",
                self.message_id
            )));
        };
        record.mark_acked();
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailDisposition, BusError> {
        let disposition = {
            let mut state = self.group.state.lock().await;
            let Some(record) = state.records.get_mut(&self.message_id) else {
                return Err(BusError::OperationFailed(format!(
                    "no record for {}",
                    self.message_id
                )));
            };

            if record.attempts >= record.max_attempts {
                record.mark_dead(error.clone());
                let dead = DeadLetter {
                    topic: self.group.topic.clone(),
                    group: self.group.name.clone(),
                    message_id: self.message_id,
                    payload: record.payload.clone(),
                    last_error: error,
                    attempts: record.attempts,
                    parked_at: Utc::now(),
                };
                state.dead.push(dead);
                FailDisposition::DeadLettered
            } else {
                let delay = self.retry.next_delay(record.attempts);
                let next_run_at = Instant::now() + delay;
                record.schedule_retry(next_run_at, error);
                state.scheduled.push(ScheduledDelivery {
                    next_run_at,
                    message_id: self.message_id,
                });
                FailDisposition::Requeued { delay }
            }
        }; // Lock released here

        // Notify outside the lock to avoid waking a consumer into contention
        if matches!(disposition, FailDisposition::Requeued { .. }) {
            self.group.notify.notify_one();
        }

        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 10,
            multiplier: 1.0,
            max_attempts,
        }
    }

    async fn lease_within(
        consumer: &Arc<dyn BusConsumer>,
        ms: u64,
    ) -> Option<Box<dyn MessageLease>> {
        timeout(Duration::from_millis(ms), consumer.lease())
            .await
            .expect("lease should not block this long")
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_group() {
        let bus = InMemoryBus::new(fast_retry(3));
        let billing = bus.subscribe("orders", "billing").await.unwrap();
        let shipping = bus.subscribe("orders", "shipping").await.unwrap();

        bus.publish("orders", json!({"n": 1})).await.unwrap();

        let a = lease_within(&billing, 100).await.unwrap();
        let b = lease_within(&shipping, 100).await.unwrap();

        // Same publish, same message id, one copy per group
        assert_eq!(a.message_id(), b.message_id());
        assert_eq!(a.payload(), b.payload());
    }

    #[tokio::test]
    async fn instances_within_a_group_compete() {
        let bus = InMemoryBus::new(fast_retry(3));
        let c1 = bus.subscribe("orders", "billing").await.unwrap();
        let c2 = bus.subscribe("orders", "billing").await.unwrap();

        bus.publish("orders", json!({"n": 1})).await.unwrap();
        bus.publish("orders", json!({"n": 2})).await.unwrap();

        let a = lease_within(&c1, 100).await.unwrap();
        let b = lease_within(&c2, 100).await.unwrap();

        // Two messages, two leases, no double delivery
        assert_ne!(a.message_id(), b.message_id());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = InMemoryBus::new(fast_retry(3));
        bus.publish("nowhere", json!({})).await.unwrap();

        let counts = bus.counts().await.unwrap();
        assert_eq!(counts.queued, 0);
    }

    #[tokio::test]
    async fn ack_marks_delivered() {
        let bus = InMemoryBus::new(fast_retry(3));
        let consumer = bus.subscribe("orders", "billing").await.unwrap();
        bus.publish("orders", json!({})).await.unwrap();

        let lease = lease_within(&consumer, 100).await.unwrap();
        assert_eq!(lease.attempt(), 1);
        lease.ack().await.unwrap();

        let counts = bus.counts().await.unwrap();
        assert_eq!(counts.acked, 1);
        assert_eq!(counts.in_flight, 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_redelivered_with_backoff() {
        let bus = InMemoryBus::new(fast_retry(3));
        let consumer = bus.subscribe("orders", "billing").await.unwrap();
        bus.publish("orders", json!({})).await.unwrap();

        let lease = lease_within(&consumer, 100).await.unwrap();
        let first_id = lease.message_id();
        let disposition = lease.fail("boom".into()).await.unwrap();
        assert!(matches!(disposition, FailDisposition::Requeued { .. }));

        // Redelivered after the 10ms backoff, same message, next attempt
        let lease = lease_within(&consumer, 500).await.unwrap();
        assert_eq!(lease.message_id(), first_id);
        assert_eq!(lease.attempt(), 2);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_parks_the_message() {
        let bus = InMemoryBus::new(fast_retry(1));
        let consumer = bus.subscribe("orders", "billing").await.unwrap();
        bus.publish("orders", json!({"n": 9})).await.unwrap();

        let lease = lease_within(&consumer, 100).await.unwrap();
        let disposition = lease.fail("boom".into()).await.unwrap();
        assert_eq!(disposition, FailDisposition::DeadLettered);

        let parked = bus.dead_letters().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].topic, "orders");
        assert_eq!(parked[0].group, "billing");
        assert_eq!(parked[0].last_error, "boom");
        assert_eq!(parked[0].attempts, 1);

        let counts = bus.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_consumers() {
        let bus = Arc::new(InMemoryBus::new(fast_retry(3)));
        let consumer = bus.subscribe("orders", "billing").await.unwrap();

        let waiter = tokio::spawn(async move { consumer.lease().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.shutdown();
        let leased = timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(leased.is_none());

        let err = bus.publish("orders", json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::ShutDown));
    }
}
