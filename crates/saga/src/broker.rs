//! Message broker abstraction and an in-memory topic exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::MessageId;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::messages::{Channel, EXCHANGE};

/// How long a delivery may stay unsettled before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by a broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No queue is bound to the routing key.
    #[error("Unroutable message: no queue bound to '{0}'")]
    Unroutable(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Ack or nack for a delivery that is not outstanding.
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(u64),

    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// A message handed to a consumer. Must be acked or nacked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub message_id: MessageId,
    pub routing_key: String,
    pub payload: serde_json::Value,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    /// Decodes the payload into a message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Trait for the message transport between the two saga roles.
///
/// Delivery is at-least-once: a delivery that is nacked with `requeue`, or
/// not settled within the broker's visibility timeout, comes back.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Routes a message to every queue bound to `routing_key`.
    async fn publish(
        &self,
        message_id: MessageId,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for the next message on `queue`.
    async fn receive(&self, queue: &str, timeout: Duration)
    -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_id: u64) -> Result<(), BrokerError>;

    /// Returns a delivery unprocessed.
    ///
    /// With `requeue` the message is redelivered unless it has used up its
    /// attempts; without it, or once attempts run out, it is parked on the
    /// queue's dead-letter queue.
    async fn nack(&self, delivery_id: u64, requeue: bool) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: MessageId,
    routing_key: String,
    payload: serde_json::Value,
    attempt: u32,
}

impl QueuedMessage {
    fn into_delivery(self, delivery_id: u64) -> Delivery {
        Delivery {
            delivery_id,
            message_id: self.message_id,
            routing_key: self.routing_key,
            payload: self.payload,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug)]
struct Unsettled {
    queue: String,
    message: QueuedMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct InMemoryBrokerState {
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    dead_letters: HashMap<String, Vec<QueuedMessage>>,
    unacked: HashMap<u64, Unsettled>,
    next_delivery_id: u64,
    published: u64,
}

impl InMemoryBrokerState {
    /// Puts a message back on its queue with one more attempt, or parks it
    /// once attempts run out. Returns true when requeued.
    fn requeue_or_park(
        &mut self,
        queue: String,
        mut message: QueuedMessage,
        requeue: bool,
        max_attempts: u32,
    ) -> bool {
        if requeue && message.attempt < max_attempts {
            message.attempt += 1;
            self.queues.entry(queue).or_default().push_back(message);
            return true;
        }

        tracing::warn!(
            exchange = EXCHANGE,
            queue = %queue,
            message_id = %message.message_id,
            attempt = message.attempt,
            "message dead-lettered"
        );
        metrics::counter!("broker_dead_lettered_total", "queue" => queue.clone()).increment(1);
        self.dead_letters
            .entry(dead_letter_name(&queue))
            .or_default()
            .push(message);
        false
    }

    /// Returns expired deliveries of `queue` as if nacked with requeue.
    fn reclaim_expired(&mut self, queue: &str, now: Instant, max_attempts: u32) {
        let expired: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.queue == queue && u.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for delivery_id in expired {
            if let Some(Unsettled { queue, message, .. }) = self.unacked.remove(&delivery_id) {
                tracing::warn!(
                    queue = %queue,
                    delivery_id,
                    message_id = %message.message_id,
                    "delivery not settled in time, redelivering"
                );
                metrics::counter!("broker_visibility_expired_total", "queue" => queue.clone())
                    .increment(1);
                self.requeue_or_park(queue, message, true, max_attempts);
            }
        }
    }

    /// Earliest moment an unsettled delivery of `queue` becomes visible again.
    fn next_reclaim(&self, queue: &str) -> Option<Instant> {
        self.unacked
            .values()
            .filter(|u| u.queue == queue)
            .map(|u| u.visible_at)
            .min()
    }
}

enum Take {
    Ready(Delivery),
    Empty { reclaim_at: Option<Instant> },
}

/// In-memory topic exchange for testing and single-process runs.
///
/// Routing keys match binding keys exactly. Every bound queue gets a
/// `<queue>.dlq` dead-letter queue. A delivery left unsettled past the
/// visibility timeout is redelivered with its attempt count raised.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryBrokerState>>,
    notify: Arc<Notify>,
    max_attempts: u32,
    visibility_timeout: Duration,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryBroker {
    /// Creates a broker with no queues.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryBrokerState::default())),
            notify: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            fail_on_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets how long a delivery may stay unsettled before redelivery.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Creates a broker with both saga channels declared and bound.
    pub async fn with_saga_topology(max_attempts: u32) -> Self {
        let broker = Self::new(max_attempts);
        for channel in Channel::ALL {
            broker
                .bind_queue(channel.queue(), channel.routing_key())
                .await;
        }
        broker
    }

    /// Declares `queue` and binds it to `routing_key`.
    pub async fn bind_queue(&self, queue: &str, routing_key: &str) {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        state
            .dead_letters
            .entry(dead_letter_name(queue))
            .or_default();
        let bound = state.bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
    }

    /// Configures the broker to refuse publishes.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of ready (not in-flight) messages on a queue.
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Returns the payloads of the ready messages on a queue, oldest first.
    pub async fn queued_payloads(&self, queue: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the payloads parked on a dead-letter queue.
    pub async fn dead_letters(&self, dead_letter_queue: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .dead_letters
            .get(dead_letter_queue)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the number of deliveries awaiting ack or nack.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Returns the number of successful publishes.
    pub async fn published_count(&self) -> u64 {
        self.state.lock().await.published
    }

    async fn try_take(&self, queue: &str) -> Result<Take, BrokerError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        let now = Instant::now();
        state.reclaim_expired(queue, now, self.max_attempts);

        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(Take::Empty {
                reclaim_at: state.next_reclaim(queue),
            });
        };

        state.next_delivery_id += 1;
        let delivery_id = state.next_delivery_id;
        state.unacked.insert(
            delivery_id,
            Unsettled {
                queue: queue.to_string(),
                message: message.clone(),
                visible_at: now + self.visibility_timeout,
            },
        );
        Ok(Take::Ready(message.into_delivery(delivery_id)))
    }

    async fn wait_for_delivery(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take(queue).await? {
                Take::Ready(delivery) => return Ok(Some(delivery)),
                Take::Empty {
                    reclaim_at: Some(at),
                } => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                Take::Empty { reclaim_at: None } => notified.await,
            }
        }
    }
}

fn dead_letter_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        message_id: MessageId,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(
                "in-memory broker is refusing publishes".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let queues = state
            .bindings
            .get(routing_key)
            .filter(|queues| !queues.is_empty())
            .cloned()
            .ok_or_else(|| BrokerError::Unroutable(routing_key.to_string()))?;

        for queue in queues {
            state
                .queues
                .entry(queue)
                .or_default()
                .push_back(QueuedMessage {
                    message_id,
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    attempt: 1,
                });
        }
        state.published += 1;
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        match tokio::time::timeout(timeout, self.wait_for_delivery(queue)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, delivery_id: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .unacked
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery_id))
    }

    async fn nack(&self, delivery_id: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Unsettled { queue, message, .. } = state
            .unacked
            .remove(&delivery_id)
            .ok_or(BrokerError::UnknownDelivery(delivery_id))?;

        if state.requeue_or_park(queue, message, requeue, self.max_attempts) {
            drop(state);
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
