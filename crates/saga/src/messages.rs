//! Message envelopes exchanged between the two saga roles.

use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, SequenceId};
use domain::{
    ApprovalDocument, Decision, MirroredStepView, NewStepView, StepOutcome, StepRecord,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use store::OutboxMessage;

/// Topic exchange both channels are multiplexed on.
pub const EXCHANGE: &str = "approval.exchange";

/// The two logical channels of the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Request side asks the Processing side to act on a step.
    StepRequest,
    /// Processing side reports a decided step.
    StepOutcome,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::StepRequest, Channel::StepOutcome];

    /// Routing key, also the binding key of the channel's queue.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Channel::StepRequest => "approval.request",
            Channel::StepOutcome => "approval.response",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Channel::StepRequest => "approval.request.queue",
            Channel::StepOutcome => "approval.response.queue",
        }
    }

    pub fn dead_letter_queue(&self) -> &'static str {
        match self {
            Channel::StepRequest => "approval.request.queue.dlq",
            Channel::StepOutcome => "approval.response.queue.dlq",
        }
    }

    /// Short discriminator for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::StepRequest => "step-request",
            Channel::StepOutcome => "step-outcome",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Natural key of a saga message: a second delivery with the same key must
/// never re-apply a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub document_id: DocumentId,
    pub step_number: u32,
    pub channel: Channel,
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.document_id, self.step_number, self.channel)
    }
}

/// A message that travels on one of the saga channels.
pub trait SagaMessage: Serialize + DeserializeOwned + Send + Sync {
    const CHANNEL: Channel;

    fn key(&self) -> MessageKey;

    /// Wraps the message for the outbox, ready to be committed with the
    /// state change that caused it.
    fn to_outbox(&self) -> Result<OutboxMessage, serde_json::Error> {
        Ok(OutboxMessage::new(
            Self::CHANNEL.routing_key(),
            serde_json::to_value(self)?,
        ))
    }
}

/// "Act on step N" request, sent by the Request side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequestEvent {
    pub document_id: DocumentId,
    pub sequence_id: SequenceId,
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub issued_at: DateTime<Utc>,
}

impl StepRequestEvent {
    /// Builds the request for one of the document's steps.
    pub fn for_step(document: &ApprovalDocument, step: &StepRecord, issued_at: DateTime<Utc>) -> Self {
        Self {
            document_id: document.id(),
            sequence_id: document.sequence_id(),
            step_number: step.step_number,
            approver_id: step.approver_id,
            requester_id: document.requester_id(),
            title: document.title().to_string(),
            content: document.content().to_string(),
            issued_at,
        }
    }

    /// The pending view the Processing side stores for this request.
    pub fn to_view(&self, received_at: DateTime<Utc>) -> MirroredStepView {
        MirroredStepView::pending(
            NewStepView {
                document_id: self.document_id,
                sequence_id: self.sequence_id,
                step_number: self.step_number,
                approver_id: self.approver_id,
                requester_id: self.requester_id,
                title: self.title.clone(),
                content: self.content.clone(),
            },
            received_at,
        )
    }
}

impl SagaMessage for StepRequestEvent {
    const CHANNEL: Channel = Channel::StepRequest;

    fn key(&self) -> MessageKey {
        MessageKey {
            document_id: self.document_id,
            step_number: self.step_number,
            channel: Self::CHANNEL,
        }
    }
}

/// Decided step, sent by the Processing side.
///
/// `step_number` is the step that was decided, not the step that comes next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcomeEvent {
    pub document_id: DocumentId,
    pub sequence_id: SequenceId,
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub status: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl StepOutcomeEvent {
    /// Builds the outcome from a freshly decided view.
    pub fn from_view(view: &MirroredStepView, decision: Decision, decided_at: DateTime<Utc>) -> Self {
        Self {
            document_id: view.document_id,
            sequence_id: view.sequence_id,
            step_number: view.step_number,
            approver_id: view.approver_id,
            status: decision,
            comment: view.comment.clone(),
            decided_at,
        }
    }

    /// The ledger input this event carries.
    pub fn to_outcome(&self) -> StepOutcome {
        StepOutcome {
            step_number: self.step_number,
            approver_id: self.approver_id,
            decision: self.status,
            comment: self.comment.clone(),
            decided_at: self.decided_at,
        }
    }
}

impl SagaMessage for StepOutcomeEvent {
    const CHANNEL: Channel = Channel::StepOutcome;

    fn key(&self) -> MessageKey {
        MessageKey {
            document_id: self.document_id,
            step_number: self.step_number,
            channel: Self::CHANNEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{NewDocument, StepSpec};

    fn document() -> ApprovalDocument {
        ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(7),
                requester_id: EmployeeId::new(1),
                title: "Trip".to_string(),
                content: "Conference in Berlin".to_string(),
                steps: vec![StepSpec::new(1, 10), StepSpec::new(2, 20)],
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_routing_keys_and_queues() {
        assert_eq!(Channel::StepRequest.routing_key(), "approval.request");
        assert_eq!(Channel::StepOutcome.routing_key(), "approval.response");
        assert_eq!(Channel::StepOutcome.queue(), "approval.response.queue");
        assert_eq!(
            Channel::StepRequest.dead_letter_queue(),
            "approval.request.queue.dlq"
        );
    }

    #[test]
    fn test_request_wire_format_is_camel_case() {
        let doc = document();
        let request = StepRequestEvent::for_step(&doc, doc.current_step().unwrap(), Utc::now());
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["sequenceId"], 7);
        assert_eq!(json["stepNumber"], 1);
        assert_eq!(json["approverId"], 10);
        assert_eq!(json["requesterId"], 1);
        assert_eq!(json["title"], "Trip");
        assert!(json.get("issuedAt").is_some());
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::json!({
            "documentId": DocumentId::new(),
            "sequenceId": 3,
            "stepNumber": 2,
            "approverId": 20,
            "status": "rejected",
            "decidedAt": "2024-05-01T10:00:00Z"
        });
        let event: StepOutcomeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.status, Decision::Rejected);
        assert_eq!(event.comment, None);
        assert_eq!(event.to_outcome().step_number, 2);
    }

    #[test]
    fn test_outbox_message_uses_channel_routing_key() {
        let doc = document();
        let request = StepRequestEvent::for_step(&doc, doc.current_step().unwrap(), Utc::now());
        let message = request.to_outbox().unwrap();
        assert_eq!(message.routing_key, "approval.request");
        assert_eq!(message.payload["stepNumber"], 1);
        assert!(!message.is_published());
    }

    #[test]
    fn test_request_to_view_is_pending() {
        let doc = document();
        let request = StepRequestEvent::for_step(&doc, doc.current_step().unwrap(), Utc::now());
        let view = request.to_view(Utc::now());
        assert!(view.is_pending());
        assert_eq!(view.document_id, doc.id());
        assert_eq!(view.approver_id, EmployeeId::new(10));
        assert_eq!(
            request.key(),
            MessageKey {
                document_id: doc.id(),
                step_number: 1,
                channel: Channel::StepRequest,
            }
        );
    }
}
