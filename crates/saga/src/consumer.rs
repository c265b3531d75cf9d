//! Broker consumer workers.
//!
//! One task per delivery, at most `concurrency` at a time. Per-document
//! ordering and exclusion are the handler's job (see [`DocumentLocks`]).
//!
//! [`DocumentLocks`]: crate::locks::DocumentLocks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

use crate::broker::{Delivery, MessageBroker};
use crate::deadline::within;
use crate::error::{ErrorKind, Result, SagaError};

/// Processes one delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Done, including duplicates and commits whose publish the relay will
    /// finish.
    Ack,
    /// Infrastructure trouble; redeliver until attempts run out.
    Requeue,
    /// Business-rule violation or malformed message; park it for inspection.
    Park,
}

impl Settlement {
    pub fn for_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Settlement::Ack,
            Err(e) => match e.kind() {
                ErrorKind::Publish => Settlement::Ack,
                ErrorKind::Transient => Settlement::Requeue,
                ErrorKind::Validation
                | ErrorKind::NotFound
                | ErrorKind::Forbidden
                | ErrorKind::Conflict => Settlement::Park,
            },
        }
    }
}

/// Consumer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Deliveries handled at the same time.
    pub concurrency: usize,
    /// Bound on one receive poll.
    pub receive_timeout: Duration,
    /// Bound on one handler run; a timed-out delivery is requeued.
    pub handler_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            receive_timeout: Duration::from_millis(1000),
            handler_timeout: Duration::from_millis(10000),
        }
    }
}

/// Pulls deliveries from one queue and feeds them to a handler.
pub struct Consumer<H> {
    name: &'static str,
    queue: String,
    broker: Arc<dyn MessageBroker>,
    handler: Arc<H>,
    settings: ConsumerSettings,
}

impl<H> Consumer<H>
where
    H: MessageHandler + 'static,
{
    pub fn new(
        name: &'static str,
        queue: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        handler: Arc<H>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            name,
            queue: queue.into(),
            broker,
            handler,
            settings,
        }
    }

    /// Consumes until `shutdown` flips to true, then waits for in-flight
    /// handlers to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = self.name, queue = %self.queue, "consumer started");
        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let received = tokio::select! {
                received = self.broker.receive(&self.queue, self.settings.receive_timeout) => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            while let Some(joined) = in_flight.try_join_next() {
                log_join_error(self.name, joined);
            }

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(consumer = self.name, error = %e, "receive failed");
                    tokio::time::sleep(self.settings.receive_timeout).await;
                    continue;
                }
            };

            let span = tracing::info_span!(
                "delivery",
                consumer = self.name,
                message_id = %delivery.message_id,
                routing_key = %delivery.routing_key,
                attempt = delivery.attempt,
            );
            let broker = self.broker.clone();
            let handler = self.handler.clone();
            let handler_timeout = self.settings.handler_timeout;
            let name = self.name;

            in_flight.spawn(
                async move {
                    let _permit = permit;
                    let result = handle_isolated(handler, delivery.clone(), handler_timeout).await;
                    settle(broker.as_ref(), name, &delivery, &result).await;
                }
                .instrument(span),
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join_error(self.name, joined);
        }
        tracing::info!(consumer = self.name, "consumer stopped");
    }
}

/// Runs the handler on its own task so a panic surfaces as a transient
/// failure and the delivery is requeued instead of left unsettled.
async fn handle_isolated<H>(handler: Arc<H>, delivery: Delivery, limit: Duration) -> Result<()>
where
    H: MessageHandler + 'static,
{
    let handling = tokio::spawn(
        async move { within(limit, "handle_delivery", handler.handle(&delivery)).await }
            .in_current_span(),
    );

    match handling.await {
        Ok(result) => result,
        Err(e) => {
            metrics::counter!("handler_panics_total").increment(1);
            tracing::error!(error = %e, "message handler panicked");
            Err(SagaError::Transient(format!("handler panicked: {e}")))
        }
    }
}

fn log_join_error(consumer: &'static str, joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(consumer, error = %e, "delivery task failed");
    }
}

/// Acks or nacks a delivery according to its handling result.
pub async fn settle(
    broker: &dyn MessageBroker,
    consumer: &'static str,
    delivery: &Delivery,
    result: &Result<()>,
) -> Settlement {
    let settlement = Settlement::for_result(result);
    let settled = match (settlement, result) {
        (Settlement::Ack, Ok(())) => broker.ack(delivery.delivery_id).await,
        (Settlement::Ack, Err(e)) => {
            tracing::warn!(error = %e, "committed; outbound message left for the outbox relay");
            broker.ack(delivery.delivery_id).await
        }
        (Settlement::Requeue, result) => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "delivery failed, requeueing");
            }
            broker.nack(delivery.delivery_id, true).await
        }
        (Settlement::Park, result) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "delivery refused, parking");
            }
            broker.nack(delivery.delivery_id, false).await
        }
    };

    metrics::counter!(
        "deliveries_total",
        "consumer" => consumer,
        "settlement" => match settlement {
            Settlement::Ack => "ack",
            Settlement::Requeue => "requeue",
            Settlement::Park => "park",
        }
    )
    .increment(1);

    if let Err(e) = settled {
        tracing::error!(error = %e, "failed to settle delivery");
    }
    settlement
}
