//! Mirrored step view owned by the Processing side.

use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, SequenceId};
use serde::{Deserialize, Serialize};

use super::{Decision, LedgerError, StepStatus};

/// Input for recording a received step request.
#[derive(Debug, Clone)]
pub struct NewStepView {
    pub document_id: DocumentId,
    pub sequence_id: SequenceId,
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
}

/// The Processing side's copy of one step of a document.
///
/// One view exists per `(document_id, step_number)`. It authorizes an
/// approver's decision and is never the source of truth for saga progress.
/// Once decided it is inert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredStepView {
    pub document_id: DocumentId,
    pub sequence_id: SequenceId,
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub status: StepStatus,
    pub comment: Option<String>,
    pub received_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl MirroredStepView {
    /// Creates a pending view from a received step request.
    pub fn pending(new: NewStepView, received_at: DateTime<Utc>) -> Self {
        Self {
            document_id: new.document_id,
            sequence_id: new.sequence_id,
            step_number: new.step_number,
            approver_id: new.approver_id,
            requester_id: new.requester_id,
            title: new.title,
            content: new.content,
            status: StepStatus::Pending,
            comment: None,
            received_at,
            decided_at: None,
        }
    }

    /// Records an approver's decision.
    ///
    /// Leaves the view untouched on error: an actor who is not the assigned
    /// approver gets `ApproverMismatch`, a step that is no longer pending
    /// gets `StepAlreadyDecided`.
    pub fn decide(
        &mut self,
        actor_id: EmployeeId,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if actor_id != self.approver_id {
            return Err(LedgerError::ApproverMismatch {
                step: self.step_number,
                expected: self.approver_id,
                actual: actor_id,
            });
        }

        if !self.status.can_decide() {
            return Err(LedgerError::StepAlreadyDecided {
                step: self.step_number,
                status: self.status,
            });
        }

        self.status = decision.into();
        self.comment = comment;
        self.decided_at = Some(now);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status.can_decide()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> MirroredStepView {
        MirroredStepView::pending(
            NewStepView {
                document_id: DocumentId::new(),
                sequence_id: SequenceId::new(3),
                step_number: 1,
                approver_id: EmployeeId::new(7),
                requester_id: EmployeeId::new(1),
                title: "Trip".to_string(),
                content: "Conference".to_string(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_new_view_is_pending() {
        let view = view();
        assert!(view.is_pending());
        assert!(view.decided_at.is_none());
    }

    #[test]
    fn test_assigned_approver_can_decide() {
        let mut view = view();
        view.decide(
            EmployeeId::new(7),
            Decision::Rejected,
            Some("no budget".to_string()),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(view.status, StepStatus::Rejected);
        assert_eq!(view.comment.as_deref(), Some("no budget"));
        assert!(view.decided_at.is_some());
    }

    #[test]
    fn test_other_actor_is_refused_without_mutation() {
        let mut view = view();
        let before = view.clone();

        let result = view.decide(EmployeeId::new(8), Decision::Approved, None, Utc::now());

        assert!(matches!(result, Err(LedgerError::ApproverMismatch { .. })));
        assert_eq!(view, before);
    }

    #[test]
    fn test_second_decision_is_refused() {
        let mut view = view();
        view.decide(EmployeeId::new(7), Decision::Approved, None, Utc::now())
            .unwrap();
        let before = view.clone();

        let result = view.decide(EmployeeId::new(7), Decision::Rejected, None, Utc::now());

        assert_eq!(
            result,
            Err(LedgerError::StepAlreadyDecided {
                step: 1,
                status: StepStatus::Approved
            })
        );
        assert_eq!(view, before);
    }
}
