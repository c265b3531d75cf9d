//! Step Executor: the Processing side of the approval saga.

use async_trait::async_trait;
use chrono::Utc;
use common::{DocumentId, EmployeeId, SequenceId};
use domain::{Decision, MirroredStepView};
use store::{OutboxStore, StepViewStore, Versioned};

use crate::broker::Delivery;
use crate::consumer::MessageHandler;
use crate::deadline::{Timeouts, within};
use crate::error::{Result, SagaError};
use crate::locks::DocumentLocks;
use crate::messages::{SagaMessage, StepOutcomeEvent, StepRequestEvent};
use crate::publisher::OutcomePublisher;

/// What receiving a step request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRequestReceived {
    /// A pending view was stored.
    Recorded,
    /// A view for this step already existed; nothing changed.
    Duplicate,
}

/// Gatekeeper for approver decisions.
///
/// Keeps one mirrored view per requested step and lets only the assigned
/// approver decide it, once. Views are never consulted for saga progress.
pub struct StepExecutor<S>
where
    S: StepViewStore + OutboxStore,
{
    store: S,
    publisher: OutcomePublisher,
    locks: DocumentLocks,
    timeouts: Timeouts,
}

impl<S> StepExecutor<S>
where
    S: StepViewStore + OutboxStore,
{
    pub fn new(store: S, publisher: OutcomePublisher, timeouts: Timeouts) -> Self {
        Self {
            store,
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

    /// Stores a pending view for a requested step, unless one exists.
    #[tracing::instrument(
        skip(self, request),
        fields(
            document_id = %request.document_id,
            sequence_id = %request.sequence_id,
            step = request.step_number,
            approver_id = %request.approver_id,
        )
    )]
    pub async fn on_step_request(&self, request: &StepRequestEvent) -> Result<StepRequestReceived> {
        if request.step_number == 0 {
            return Err(SagaError::Validation(
                "step numbers start at 1".to_string(),
            ));
        }

        let _guard = self.locks.acquire(request.document_id).await;

        let inserted = within(
            self.timeouts.store,
            "insert_view_if_absent",
            self.store.insert_view_if_absent(&request.to_view(Utc::now())),
        )
        .await?;

        if inserted {
            metrics::counter!("step_requests_recorded_total").increment(1);
            tracing::info!("step awaiting decision");
            Ok(StepRequestReceived::Recorded)
        } else {
            metrics::counter!("duplicate_deliveries_total", "side" => "processing").increment(1);
            tracing::info!(key = %request.key(), "duplicate step request discarded");
            Ok(StepRequestReceived::Duplicate)
        }
    }

    /// Records an approver's decision and reports it to the Request side.
    ///
    /// Fails with `Forbidden` for anyone but the assigned approver and with
    /// `Conflict` when the step is no longer pending; neither changes
    /// anything. Once the decision is committed, a broker failure surfaces
    /// as `Publish` and the outbox relay delivers the outcome.
    #[tracing::instrument(
        skip_all,
        fields(
            document_id = %document_id,
            step = step_number,
            actor_id = %actor_id,
            decision = %decision,
        )
    )]
    pub async fn decide(
        &self,
        document_id: DocumentId,
        step_number: u32,
        actor_id: EmployeeId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<StepOutcomeEvent> {
        let _guard = self.locks.acquire(document_id).await;

        let Versioned {
            value: mut view,
            version,
        } = within(
            self.timeouts.store,
            "get_view",
            self.store.get_view(document_id, step_number),
        )
        .await?
        .ok_or_else(|| {
            SagaError::NotFound(format!("step {step_number} of document {document_id}"))
        })?;

        let decided_at = Utc::now();
        view.decide(actor_id, decision, comment, decided_at)
            .inspect_err(|e| tracing::info!(error = %e, "decision refused"))?;

        let outcome = StepOutcomeEvent::from_view(&view, decision, decided_at);
        let outbox = vec![outcome.to_outbox()?];

        within(
            self.timeouts.store,
            "compare_and_swap_view",
            self.store.compare_and_swap_view(&view, version, outbox.clone()),
        )
        .await?;

        metrics::counter!("decisions_total", "decision" => decision.as_str()).increment(1);
        if let Ok(waited) = (decided_at - view.received_at).to_std() {
            metrics::histogram!("decision_latency_seconds").record(waited.as_secs_f64());
        }
        tracing::info!("decision recorded");

        self.publisher.publish_committed(&self.store, &outbox).await?;
        Ok(outcome)
    }

    /// Decides the step currently awaiting action on a document, looked up
    /// by sequence id.
    pub async fn decide_current(
        &self,
        sequence_id: SequenceId,
        actor_id: EmployeeId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<StepOutcomeEvent> {
        let current = within(
            self.timeouts.store,
            "current_view_for_sequence",
            self.store.current_view_for_sequence(sequence_id),
        )
        .await?
        .ok_or_else(|| {
            SagaError::NotFound(format!("no step received for approval document {sequence_id}"))
        })?;

        self.decide(
            current.value.document_id,
            current.value.step_number,
            actor_id,
            decision,
            comment,
        )
        .await
    }

    /// Lists the steps waiting on an approver, oldest document first.
    pub async fn list_pending(&self, approver_id: EmployeeId) -> Result<Vec<MirroredStepView>> {
        within(
            self.timeouts.store,
            "list_pending_views",
            self.store.list_pending_views(approver_id),
        )
        .await
    }
}

#[async_trait]
impl<S> MessageHandler for StepExecutor<S>
where
    S: StepViewStore + OutboxStore,
{
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let request: StepRequestEvent = delivery.decode()?;
        self.on_step_request(&request).await.map(|_| ())
    }
}
