//! Outcome Publisher and the outbox relay that backs it.
//!
//! Messages are always committed to the outbox together with the state
//! change that caused them. The publisher then tries to send them straight
//! away; whatever it could not send is picked up by [`OutboxRelay`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use store::{OutboxMessage, OutboxStore};
use tokio::sync::watch;

use crate::broker::MessageBroker;
use crate::deadline::within;
use crate::error::{Result, SagaError};

/// Places committed outbox messages on the broker.
///
/// Every broker publish and every outbox mark is bounded by `timeout`.
#[derive(Clone)]
pub struct OutcomePublisher {
    broker: Arc<dyn MessageBroker>,
    timeout: Duration,
}

impl OutcomePublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            timeout: Duration::from_millis(2000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publishes a single message.
    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, routing_key = %message.routing_key))]
    pub async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        let sent = within(
            self.timeout,
            "broker_publish",
            self.broker
                .publish(message.id, &message.routing_key, &message.payload),
        )
        .await;

        match sent {
            Ok(()) => {
                metrics::counter!("messages_published_total", "routing_key" => message.routing_key.clone())
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!("messages_publish_failed_total", "routing_key" => message.routing_key.clone())
                    .increment(1);
                Err(SagaError::Publish(e.to_string()))
            }
        }
    }

    /// Publishes messages that were just committed and marks them sent.
    ///
    /// Stops at the first broker failure and returns `Publish`; the relay
    /// re-sends the rest. Failing to mark a sent message only risks a
    /// duplicate send, which consumers absorb, so it is logged and skipped.
    pub async fn publish_committed<O>(&self, outbox: &O, messages: &[OutboxMessage]) -> Result<()>
    where
        O: OutboxStore + ?Sized,
    {
        for message in messages {
            self.publish(message).await?;
            let marked = within(
                self.timeout,
                "mark_published",
                outbox.mark_published(message.id, Utc::now()),
            )
            .await;
            if let Err(e) = marked {
                tracing::warn!(message_id = %message.id, error = %e, "failed to mark message published");
            }
        }
        Ok(())
    }
}

/// Settings for the outbox relay sweep.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Pause between sweeps.
    pub interval: Duration,
    /// Minimum message age before the relay touches it, leaving the
    /// publisher a head start on fresh commits.
    pub grace: Duration,
    pub batch_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            grace: Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

/// Background re-publisher for outbox messages left unsent.
pub struct OutboxRelay<O> {
    outbox: O,
    publisher: OutcomePublisher,
    settings: RelaySettings,
    name: &'static str,
}

impl<O> OutboxRelay<O>
where
    O: OutboxStore,
{
    pub fn new(
        name: &'static str,
        outbox: O,
        publisher: OutcomePublisher,
        settings: RelaySettings,
    ) -> Self {
        Self {
            outbox,
            publisher,
            settings,
            name,
        }
    }

    /// Sends every unpublished message older than the grace period.
    ///
    /// Returns how many were published. Stops at the first broker failure;
    /// the next sweep picks up where this one stopped.
    pub async fn sweep(&self) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.settings.grace).unwrap_or_default();
        let cutoff = Utc::now() - grace;
        let pending = self
            .outbox
            .pending_outbox(cutoff, self.settings.batch_size)
            .await?;

        let mut sent = 0;
        for message in &pending {
            self.publisher.publish(message).await?;
            self.outbox.mark_published(message.id, Utc::now()).await?;
            sent += 1;
        }

        if sent > 0 {
            metrics::counter!("outbox_relay_republished_total", "relay" => self.name)
                .increment(sent as u64);
            tracing::info!(relay = self.name, count = sent, "relay re-published outbox messages");
        }
        Ok(sent)
    }

    /// Sweeps on an interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(relay = self.name, "outbox relay started");
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(relay = self.name, error = %e, "outbox sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(relay = self.name, "outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use common::{DocumentId, EmployeeId, SequenceId};
    use domain::{ApprovalDocument, NewDocument, StepSpec};
    use store::{DocumentStore, InMemoryStore};

    fn document() -> ApprovalDocument {
        ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(1),
                requester_id: EmployeeId::new(1),
                title: "t".to_string(),
                content: "c".to_string(),
                steps: vec![StepSpec::new(1, 2)],
            },
            Utc::now(),
        )
        .unwrap()
    }

    async fn setup() -> (InMemoryStore, InMemoryBroker, OutcomePublisher) {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::with_saga_topology(3).await;
        let publisher = OutcomePublisher::new(Arc::new(broker.clone()));
        (store, broker, publisher)
    }

    fn immediate() -> RelaySettings {
        RelaySettings {
            grace: Duration::ZERO,
            ..RelaySettings::default()
        }
    }

    #[tokio::test]
    async fn test_publish_committed_marks_published() {
        let (store, broker, publisher) = setup().await;
        let message = OutboxMessage::new("approval.request", serde_json::json!({"n": 1}));
        store
            .insert_document(&document(), vec![message.clone()])
            .await
            .unwrap();

        publisher
            .publish_committed(&store, &[message])
            .await
            .unwrap();

        assert_eq!(broker.queue_len("approval.request.queue").await, 1);
        assert!(store.pending_outbox(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_is_left_for_relay() {
        let (store, broker, publisher) = setup().await;
        let message = OutboxMessage::new("approval.request", serde_json::json!({"n": 1}));
        store
            .insert_document(&document(), vec![message.clone()])
            .await
            .unwrap();

        broker.set_fail_on_publish(true);
        let err = publisher
            .publish_committed(&store, &[message])
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Publish(_)));
        assert_eq!(store.pending_outbox(Utc::now(), 10).await.unwrap().len(), 1);

        broker.set_fail_on_publish(false);
        let relay = OutboxRelay::new("test", store.clone(), publisher, immediate());
        assert_eq!(relay.sweep().await.unwrap(), 1);
        assert_eq!(broker.queue_len("approval.request.queue").await, 1);
        assert_eq!(relay.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_respects_grace_period() {
        let (store, broker, publisher) = setup().await;
        let message = OutboxMessage::new("approval.request", serde_json::json!({}));
        store
            .insert_document(&document(), vec![message])
            .await
            .unwrap();

        let relay = OutboxRelay::new(
            "test",
            store,
            publisher,
            RelaySettings {
                grace: Duration::from_secs(60),
                ..RelaySettings::default()
            },
        );
        assert_eq!(relay.sweep().await.unwrap(), 0);
        assert_eq!(broker.queue_len("approval.request.queue").await, 0);
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let (store, _broker, publisher) = setup().await;
        let relay = OutboxRelay::new("test", store, publisher, immediate());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
