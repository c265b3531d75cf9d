//! Saga Coordinator: the Request side of the approval saga.

use async_trait::async_trait;
use chrono::Utc;
use common::{DocumentId, EmployeeId, SequenceId};
use domain::{
    ApprovalDocument, LedgerError, NewDocument, OverallStatus, StepSpec,
};
use serde::{Deserialize, Serialize};
use store::{DocumentStore, OutboxStore, Versioned};

use crate::broker::Delivery;
use crate::consumer::MessageHandler;
use crate::deadline::{Timeouts, within};
use crate::error::{Result, SagaError};
use crate::locks::DocumentLocks;
use crate::messages::{SagaMessage, StepOutcomeEvent, StepRequestEvent};
use crate::publisher::OutcomePublisher;
use crate::services::{Notifier, OutcomeNotification, ParticipantDirectory};

/// Input for a new approval document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocument {
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub steps: Vec<StepSpec>,
}

/// What applying a step outcome did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeApplied {
    /// The step was approved and the next one was requested.
    Advanced { next_step: u32 },
    /// The document reached a terminal status.
    Finalized { status: OverallStatus },
    /// The step was already decided; nothing changed.
    Duplicate,
}

/// Owns the canonical approval documents and drives them to a terminal
/// status.
///
/// Every transition is read, evaluated, committed together with its outbound
/// step request, and only then published, all under the document's lock.
pub struct SagaCoordinator<S, D, N>
where
    S: DocumentStore + OutboxStore,
    D: ParticipantDirectory,
    N: Notifier,
{
    store: S,
    directory: D,
    notifier: N,
    publisher: OutcomePublisher,
    locks: DocumentLocks,
    timeouts: Timeouts,
}

impl<S, D, N> SagaCoordinator<S, D, N>
where
    S: DocumentStore + OutboxStore,
    D: ParticipantDirectory,
    N: Notifier,
{
    /// Creates a new saga coordinator.
    pub fn new(
        store: S,
        directory: D,
        notifier: N,
        publisher: OutcomePublisher,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            publisher,
            locks: DocumentLocks::new(),
            timeouts,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &OutcomePublisher {
        &self.publisher
    }

    /// Validates and stores a new document, then requests its first step.
    ///
    /// Nothing is stored when validation fails. Once the document is
    /// committed the call succeeds even if the first step request could not
    /// be published; the outbox relay sends it later.
    #[tracing::instrument(skip(self, request), fields(requester_id = %request.requester_id, steps = request.steps.len()))]
    pub async fn create_document(&self, request: CreateDocument) -> Result<SequenceId> {
        let mut new = NewDocument {
            id: DocumentId::new(),
            // Assigned once validation passes.
            sequence_id: SequenceId::new(0),
            requester_id: request.requester_id,
            title: request.title,
            content: request.content,
            steps: request.steps,
        };
        new.validate()?;
        self.check_participants(&new.participants()).await?;

        new.sequence_id =
            within(self.timeouts.store, "next_sequence_id", self.store.next_sequence_id()).await?;
        let document = ApprovalDocument::create(new, Utc::now())?;

        let first = document
            .current_step()
            .ok_or(SagaError::Ledger(LedgerError::EmptySteps))?;
        let outbox = vec![StepRequestEvent::for_step(&document, first, Utc::now()).to_outbox()?];

        within(
            self.timeouts.store,
            "insert_document",
            self.store.insert_document(&document, outbox.clone()),
        )
        .await?;

        metrics::counter!("documents_created_total").increment(1);
        tracing::info!(
            document_id = %document.id(),
            sequence_id = %document.sequence_id(),
            "approval document created"
        );

        if let Err(e) = self.publisher.publish_committed(&self.store, &outbox).await {
            tracing::warn!(
                sequence_id = %document.sequence_id(),
                error = %e,
                "first step request left for the outbox relay"
            );
        }

        Ok(document.sequence_id())
    }

    async fn check_participants(&self, ids: &[EmployeeId]) -> Result<()> {
        for &id in ids {
            let found = within(
                self.timeouts.collaborator,
                "participant_lookup",
                self.directory.exists(id),
            )
            .await;
            match found {
                Ok(true) => {}
                Ok(false) => {
                    return Err(SagaError::Validation(format!("Unknown participant: {id}")));
                }
                Err(e) => {
                    return Err(SagaError::Validation(format!(
                        "Could not verify participant {id}: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Applies a step outcome reported by the Processing side.
    ///
    /// A redelivered outcome for an already-decided step is a no-op. An
    /// outcome for a step other than the current one, or for a finalized
    /// document, is refused with `Conflict`. Any failure before the commit
    /// leaves the document untouched.
    #[tracing::instrument(
        skip(self, event),
        fields(
            document_id = %event.document_id,
            sequence_id = %event.sequence_id,
            step = event.step_number,
            status = %event.status,
        )
    )]
    pub async fn apply_step_outcome(&self, event: &StepOutcomeEvent) -> Result<OutcomeApplied> {
        let _guard = self.locks.acquire(event.document_id).await;

        let Versioned {
            value: mut document,
            version,
        } = within(
            self.timeouts.store,
            "get_document",
            self.store.get_document(event.document_id),
        )
        .await?
        .ok_or_else(|| SagaError::NotFound(format!("document {}", event.document_id)))?;

        if document.sequence_id() != event.sequence_id {
            return Err(SagaError::Validation(format!(
                "outcome for document {} carries sequence {}, expected {}",
                event.document_id,
                event.sequence_id,
                document.sequence_id()
            )));
        }

        let events = document.record_outcome(&event.to_outcome()).inspect_err(|e| {
            if matches!(e, LedgerError::OutOfOrder { .. }) {
                metrics::counter!("outcomes_out_of_order_total").increment(1);
            }
        })?;

        if events.is_empty() {
            metrics::counter!("duplicate_deliveries_total", "side" => "request").increment(1);
            tracing::info!(key = %event.key(), "duplicate step outcome discarded");
            return Ok(OutcomeApplied::Duplicate);
        }

        document.apply_events(events);

        let mut outbox = Vec::new();
        let applied = match document.current_step() {
            Some(next) => {
                outbox.push(StepRequestEvent::for_step(&document, next, Utc::now()).to_outbox()?);
                OutcomeApplied::Advanced {
                    next_step: next.step_number,
                }
            }
            None => OutcomeApplied::Finalized {
                status: document.status(),
            },
        };

        within(
            self.timeouts.store,
            "compare_and_swap_document",
            self.store
                .compare_and_swap_document(&document, version, outbox.clone()),
        )
        .await?;

        metrics::counter!("outcomes_applied_total", "status" => event.status.as_str())
            .increment(1);
        tracing::info!(?applied, "step outcome applied");

        self.publisher.publish_committed(&self.store, &outbox).await?;

        if document.is_terminal() {
            self.notify(&document).await;
        }

        Ok(applied)
    }

    async fn notify(&self, document: &ApprovalDocument) {
        let notification = OutcomeNotification::for_document(document);
        let sent = within(
            self.timeouts.collaborator,
            "notify_outcome",
            self.notifier.notify_outcome(&notification),
        )
        .await;

        if let Err(e) = sent {
            metrics::counter!("notifications_failed_total").increment(1);
            tracing::warn!(
                sequence_id = %document.sequence_id(),
                error = %e,
                "outcome notification failed"
            );
        }
    }

    /// Reads a document by its sequence id.
    pub async fn get_document(&self, sequence_id: SequenceId) -> Result<ApprovalDocument> {
        within(
            self.timeouts.store,
            "get_document_by_sequence",
            self.store.get_document_by_sequence(sequence_id),
        )
        .await?
        .map(Versioned::into_inner)
        .ok_or_else(|| SagaError::NotFound(format!("approval document {sequence_id}")))
    }

    /// Lists every document ordered by sequence id.
    pub async fn list_documents(&self) -> Result<Vec<ApprovalDocument>> {
        within(
            self.timeouts.store,
            "list_documents",
            self.store.list_documents(),
        )
        .await
    }
}

#[async_trait]
impl<S, D, N> MessageHandler for SagaCoordinator<S, D, N>
where
    S: DocumentStore + OutboxStore,
    D: ParticipantDirectory,
    N: Notifier,
{
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let event: StepOutcomeEvent = delivery.decode()?;
        self.apply_step_outcome(&event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use domain::{Decision, StepStatus};
    use store::InMemoryStore;

    use crate::broker::InMemoryBroker;
    use crate::error::ErrorKind;
    use crate::messages::Channel;
    use crate::services::{InMemoryNotifier, InMemoryParticipantDirectory};

    type TestCoordinator =
        SagaCoordinator<InMemoryStore, InMemoryParticipantDirectory, InMemoryNotifier>;

    struct Harness {
        coordinator: TestCoordinator,
        store: InMemoryStore,
        broker: InMemoryBroker,
        directory: InMemoryParticipantDirectory,
        notifier: InMemoryNotifier,
    }

    async fn harness() -> Harness {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::with_saga_topology(3).await;
        let directory = InMemoryParticipantDirectory::with_participants(
            [1, 10, 20].into_iter().map(EmployeeId::new),
        );
        let notifier = InMemoryNotifier::new();
        let coordinator = SagaCoordinator::new(
            store.clone(),
            directory.clone(),
            notifier.clone(),
            OutcomePublisher::new(Arc::new(broker.clone())),
            Timeouts::default(),
        );
        Harness {
            coordinator,
            store,
            broker,
            directory,
            notifier,
        }
    }

    fn two_steps() -> CreateDocument {
        CreateDocument {
            requester_id: EmployeeId::new(1),
            title: "Budget".to_string(),
            content: "Q3 budget".to_string(),
            steps: vec![StepSpec::new(1, 10), StepSpec::new(2, 20)],
        }
    }

    fn outcome(
        document: &ApprovalDocument,
        step: u32,
        approver: i64,
        status: Decision,
    ) -> StepOutcomeEvent {
        StepOutcomeEvent {
            document_id: document.id(),
            sequence_id: document.sequence_id(),
            step_number: step,
            approver_id: EmployeeId::new(approver),
            status,
            comment: None,
            decided_at: Utc::now(),
        }
    }

    async fn request_queue(h: &Harness) -> Vec<StepRequestEvent> {
        h.broker
            .queued_payloads(Channel::StepRequest.queue())
            .await
            .into_iter()
            .map(|p| serde_json::from_value(p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_create_requests_first_step() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();

        let doc = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(doc.status(), OverallStatus::InProgress);
        assert_eq!(doc.current_step_number(), 1);

        let requests = request_queue(&h).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].step_number, 1);
        assert_eq!(requests[0].approver_id, EmployeeId::new(10));
        assert!(h.store.pending_outbox(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_participant() {
        let h = harness().await;
        let mut request = two_steps();
        request.steps[1] = StepSpec::new(2, 99);

        let err = h.coordinator.create_document(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.coordinator.list_documents().await.unwrap().is_empty());
        assert_eq!(h.broker.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_when_directory_unreachable() {
        let h = harness().await;
        h.directory.set_fail_on_lookup(true);

        let err = h.coordinator.create_document(two_steps()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.coordinator.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_numbering() {
        let h = harness().await;
        let mut request = two_steps();
        request.steps[1] = StepSpec::new(3, 20);

        let err = h.coordinator.create_document(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.coordinator.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_survives_publish_failure() {
        let h = harness().await;
        h.broker.set_fail_on_publish(true);

        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        assert!(h.coordinator.get_document(seq).await.is_ok());
        assert_eq!(h.store.pending_outbox(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_approve_advances_then_finalizes() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        let applied = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 1, 10, Decision::Approved))
            .await
            .unwrap();
        assert_eq!(applied, OutcomeApplied::Advanced { next_step: 2 });

        let requests = request_queue(&h).await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].step_number, 2);
        assert_eq!(requests[1].approver_id, EmployeeId::new(20));

        let applied = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 2, 20, Decision::Approved))
            .await
            .unwrap();
        assert_eq!(
            applied,
            OutcomeApplied::Finalized {
                status: OverallStatus::Approved
            }
        );

        let doc = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(doc.status(), OverallStatus::Approved);
        assert_eq!(doc.current_step_number(), 2);
        assert_eq!(request_queue(&h).await.len(), 2);

        let sent = h.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].final_status, OverallStatus::Approved);
        assert_eq!(sent[0].rejected_by, None);
    }

    #[tokio::test]
    async fn test_duplicate_outcome_is_discarded() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();
        let event = outcome(&doc, 1, 10, Decision::Approved);

        h.coordinator.apply_step_outcome(&event).await.unwrap();
        let before = h.coordinator.get_document(seq).await.unwrap();

        let applied = h.coordinator.apply_step_outcome(&event).await.unwrap();
        assert_eq!(applied, OutcomeApplied::Duplicate);

        let after = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(request_queue(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_freezes_later_steps() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        let applied = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 1, 10, Decision::Rejected))
            .await
            .unwrap();
        assert_eq!(
            applied,
            OutcomeApplied::Finalized {
                status: OverallStatus::Rejected
            }
        );

        let err = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 2, 20, Decision::Approved))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let doc = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(doc.status(), OverallStatus::Rejected);
        assert_eq!(doc.step(2).unwrap().status, StepStatus::Pending);

        let sent = h.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].rejected_by, Some(EmployeeId::new(10)));
    }

    #[tokio::test]
    async fn test_out_of_order_outcome_is_refused() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        let err = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 2, 20, Decision::Approved))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            h.coordinator.get_document(seq).await.unwrap().current_step_number(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();
        let mut event = outcome(&doc, 1, 10, Decision::Approved);
        event.document_id = DocumentId::new();

        let err = h.coordinator.apply_step_outcome(&event).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_document_untouched() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        h.store.set_fail_writes(true);
        let err = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 1, 10, Decision::Approved))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        h.store.set_fail_writes(false);

        let after = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(after, doc);
        assert_eq!(request_queue(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_after_commit() {
        let h = harness().await;
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        h.broker.set_fail_on_publish(true);
        let err = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 1, 10, Decision::Approved))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Publish);

        let after = h.coordinator.get_document(seq).await.unwrap();
        assert_eq!(after.current_step_number(), 2);
        assert_eq!(h.store.pending_outbox(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_saga() {
        let h = harness().await;
        h.notifier.set_fail_on_notify(true);
        let seq = h.coordinator.create_document(two_steps()).await.unwrap();
        let doc = h.coordinator.get_document(seq).await.unwrap();

        let applied = h
            .coordinator
            .apply_step_outcome(&outcome(&doc, 1, 10, Decision::Rejected))
            .await
            .unwrap();
        assert!(matches!(applied, OutcomeApplied::Finalized { .. }));
    }
}
