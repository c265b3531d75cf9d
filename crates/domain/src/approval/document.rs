//! Approval document aggregate: the canonical step ledger.

use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, SequenceId};
use serde::{Deserialize, Serialize};

use super::{
    Decision, LedgerError, LedgerEvent, OverallStatus, StepOutcome, StepRecord, StepSpec,
    StepStatus, validate_steps,
};

/// Input for creating a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: DocumentId,
    pub sequence_id: SequenceId,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub steps: Vec<StepSpec>,
}

impl NewDocument {
    /// Checks the input without building a document.
    ///
    /// The requester must be a valid employee id, title and content must not
    /// be blank, and the step list must pass [`validate_steps`].
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.requester_id.as_i64() <= 0 {
            return Err(LedgerError::InvalidParticipant(self.requester_id));
        }
        if self.title.trim().is_empty() {
            return Err(LedgerError::BlankField("title"));
        }
        if self.content.trim().is_empty() {
            return Err(LedgerError::BlankField("content"));
        }
        validate_steps(&self.steps)
    }

    /// Every participant id: the requester followed by each distinct approver.
    pub fn participants(&self) -> Vec<EmployeeId> {
        let mut ids = vec![self.requester_id];
        for spec in &self.steps {
            if !ids.contains(&spec.approver_id) {
                ids.push(spec.approver_id);
            }
        }
        ids
    }
}

/// Approval document owned by the Request side.
///
/// Invariants:
/// - `steps` is non-empty and numbered exactly `1..=N`
/// - `current_step` never decreases, and is frozen once `status` is terminal
/// - a decided step never changes again
/// - `Approved` means every step is approved; `Rejected` means exactly one
///   step is rejected and every step after it is still pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDocument {
    id: DocumentId,
    sequence_id: SequenceId,
    requester_id: EmployeeId,
    title: String,
    content: String,
    steps: Vec<StepRecord>,
    current_step: u32,
    status: OverallStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    history: Vec<LedgerEvent>,
}

impl ApprovalDocument {
    /// Validates the input and creates an in-progress document pointing at step 1.
    pub fn create(new: NewDocument, now: DateTime<Utc>) -> Result<Self, LedgerError> {
        new.validate()?;

        Ok(Self {
            id: new.id,
            sequence_id: new.sequence_id,
            requester_id: new.requester_id,
            title: new.title,
            content: new.content,
            steps: new.steps.into_iter().map(StepRecord::pending).collect(),
            current_step: 1,
            status: OverallStatus::InProgress,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }
}

// Query methods
impl ApprovalDocument {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn requester_id(&self) -> EmployeeId {
        self.requester_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Returns the step with the given 1-based number.
    pub fn step(&self, step_number: u32) -> Option<&StepRecord> {
        let index = step_number.checked_sub(1)? as usize;
        self.steps.get(index)
    }

    /// Returns the step pointer. Frozen at its last value once the document
    /// is terminal.
    pub fn current_step_number(&self) -> u32 {
        self.current_step
    }

    /// Returns the step awaiting action, or None once the document is terminal.
    pub fn current_step(&self) -> Option<&StepRecord> {
        if self.status.is_terminal() {
            return None;
        }
        self.step(self.current_step)
    }

    pub fn status(&self) -> OverallStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_last_step(&self, step_number: u32) -> bool {
        step_number == self.step_count()
    }

    /// Returns the approver whose rejection ended the document, if any.
    pub fn rejected_by(&self) -> Option<EmployeeId> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Rejected)
            .map(|s| s.approver_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns every transition applied so far, oldest first.
    pub fn history(&self) -> &[LedgerEvent] {
        &self.history
    }
}

// Command methods (return events)
impl ApprovalDocument {
    /// Evaluates a step outcome against the ledger.
    ///
    /// Returns the events to apply. An empty list means the referenced step is
    /// already decided: the outcome is a redelivery or a stale duplicate and
    /// must be discarded without any further effect.
    pub fn record_outcome(&self, outcome: &StepOutcome) -> Result<Vec<LedgerEvent>, LedgerError> {
        let step = self
            .step(outcome.step_number)
            .ok_or(LedgerError::UnknownStep {
                step: outcome.step_number,
            })?;

        if step.status.is_terminal() {
            return Ok(vec![]);
        }

        if self.status.is_terminal() {
            return Err(LedgerError::DocumentFinalized {
                status: self.status,
            });
        }

        if outcome.step_number != self.current_step {
            return Err(LedgerError::OutOfOrder {
                expected: self.current_step,
                received: outcome.step_number,
            });
        }

        if outcome.approver_id != step.approver_id {
            return Err(LedgerError::ApproverMismatch {
                step: step.step_number,
                expected: step.approver_id,
                actual: outcome.approver_id,
            });
        }

        let at = outcome.decided_at;
        let events = match outcome.decision {
            Decision::Approved => {
                let approved = LedgerEvent::step_approved(
                    step.step_number,
                    step.approver_id,
                    outcome.comment.clone(),
                    at,
                );
                if self.is_last_step(step.step_number) {
                    vec![approved, LedgerEvent::document_approved(at)]
                } else {
                    vec![
                        approved,
                        LedgerEvent::pointer_advanced(step.step_number, step.step_number + 1, at),
                    ]
                }
            }
            Decision::Rejected => vec![
                LedgerEvent::step_rejected(
                    step.step_number,
                    step.approver_id,
                    outcome.comment.clone(),
                    at,
                ),
                LedgerEvent::document_rejected(step.step_number, step.approver_id, at),
            ],
        };

        Ok(events)
    }

    /// Applies an event to the document and appends it to the history.
    ///
    /// Events are facts produced by `record_outcome`; applying them never fails.
    pub fn apply(&mut self, event: LedgerEvent) {
        match &event {
            LedgerEvent::StepApproved(data) => {
                self.decide_step(data.step_number, StepStatus::Approved, data)
            }
            LedgerEvent::StepRejected(data) => {
                self.decide_step(data.step_number, StepStatus::Rejected, data)
            }
            LedgerEvent::PointerAdvanced(data) => {
                if self.status.is_in_progress() {
                    self.current_step = self.current_step.max(data.to);
                }
            }
            LedgerEvent::DocumentApproved(_) => {
                if self.status.is_in_progress() {
                    self.status = OverallStatus::Approved;
                }
            }
            LedgerEvent::DocumentRejected(_) => {
                if self.status.is_in_progress() {
                    self.status = OverallStatus::Rejected;
                }
            }
        }
        self.updated_at = self.updated_at.max(event.occurred_at());
        self.history.push(event);
    }

    /// Applies multiple events in sequence.
    pub fn apply_events(&mut self, events: impl IntoIterator<Item = LedgerEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    fn decide_step(&mut self, step_number: u32, status: StepStatus, data: &super::StepDecidedData) {
        let Some(index) = step_number.checked_sub(1) else {
            return;
        };
        if let Some(step) = self.steps.get_mut(index as usize)
            && step.status.can_decide()
        {
            step.status = status;
            step.comment = data.comment.clone();
            step.decided_at = Some(data.decided_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_document() -> ApprovalDocument {
        ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(1),
                requester_id: EmployeeId::new(100),
                title: "Laptop purchase".to_string(),
                content: "Need a new laptop".to_string(),
                steps: vec![StepSpec::new(1, 1), StepSpec::new(2, 2)],
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn outcome(step: u32, approver: i64, decision: Decision) -> StepOutcome {
        StepOutcome {
            step_number: step,
            approver_id: EmployeeId::new(approver),
            decision,
            comment: Some("ok".to_string()),
            decided_at: Utc::now(),
        }
    }

    fn record(doc: &mut ApprovalDocument, outcome: &StepOutcome) -> Vec<LedgerEvent> {
        let events = doc.record_outcome(outcome).unwrap();
        doc.apply_events(events.clone());
        events
    }

    #[test]
    fn test_create_starts_in_progress_at_step_one() {
        let doc = two_step_document();
        assert_eq!(doc.status(), OverallStatus::InProgress);
        assert_eq!(doc.current_step_number(), 1);
        assert_eq!(doc.current_step().unwrap().approver_id, EmployeeId::new(1));
        assert!(doc.steps().iter().all(|s| s.status == StepStatus::Pending));
        assert!(doc.history().is_empty());
    }

    #[test]
    fn test_create_rejects_blank_title() {
        let result = ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(1),
                requester_id: EmployeeId::new(100),
                title: "   ".to_string(),
                content: "body".to_string(),
                steps: vec![StepSpec::new(1, 1)],
            },
            Utc::now(),
        );
        assert_eq!(result.unwrap_err(), LedgerError::BlankField("title"));
    }

    #[test]
    fn test_participants_are_deduplicated() {
        let new = NewDocument {
            id: DocumentId::new(),
            sequence_id: SequenceId::new(1),
            requester_id: EmployeeId::new(100),
            title: "t".to_string(),
            content: "c".to_string(),
            steps: vec![
                StepSpec::new(1, 7),
                StepSpec::new(2, 8),
                StepSpec::new(3, 7),
            ],
        };
        assert!(new.validate().is_ok());
        assert_eq!(
            new.participants(),
            vec![EmployeeId::new(100), EmployeeId::new(7), EmployeeId::new(8)]
        );
    }

    #[test]
    fn test_create_rejects_bad_numbering() {
        let result = ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(1),
                requester_id: EmployeeId::new(100),
                title: "t".to_string(),
                content: "c".to_string(),
                steps: vec![StepSpec::new(1, 1), StepSpec::new(3, 2)],
            },
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(LedgerError::NonContiguousSteps { .. })
        ));
    }

    #[test]
    fn test_approve_first_step_advances_pointer() {
        let mut doc = two_step_document();
        let events = record(&mut doc, &outcome(1, 1, Decision::Approved));

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], LedgerEvent::PointerAdvanced(ref d) if d.to == 2));
        assert_eq!(doc.status(), OverallStatus::InProgress);
        assert_eq!(doc.current_step_number(), 2);
        assert_eq!(doc.step(1).unwrap().status, StepStatus::Approved);
        assert_eq!(doc.step(1).unwrap().comment.as_deref(), Some("ok"));
        assert!(doc.step(1).unwrap().decided_at.is_some());
    }

    #[test]
    fn test_approve_last_step_finalizes() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Approved));
        record(&mut doc, &outcome(2, 2, Decision::Approved));

        assert_eq!(doc.status(), OverallStatus::Approved);
        assert_eq!(doc.current_step_number(), 2);
        assert!(doc.current_step().is_none());
        assert!(doc.steps().iter().all(|s| s.status == StepStatus::Approved));
    }

    #[test]
    fn test_reject_finalizes_immediately() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Rejected));

        assert_eq!(doc.status(), OverallStatus::Rejected);
        assert_eq!(doc.current_step_number(), 1);
        assert_eq!(doc.step(2).unwrap().status, StepStatus::Pending);
        assert_eq!(doc.rejected_by(), Some(EmployeeId::new(1)));
    }

    #[test]
    fn test_redelivered_outcome_is_duplicate() {
        let mut doc = two_step_document();
        let first = outcome(1, 1, Decision::Approved);
        record(&mut doc, &first);
        let snapshot = doc.clone();

        let events = doc.record_outcome(&first).unwrap();
        assert!(events.is_empty());
        assert_eq!(doc, snapshot);
    }

    #[test]
    fn test_conflicting_redelivery_is_still_duplicate() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Approved));
        let events = doc
            .record_outcome(&outcome(1, 1, Decision::Rejected))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(doc.step(1).unwrap().status, StepStatus::Approved);
    }

    #[test]
    fn test_outcome_after_rejection_is_refused() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Rejected));

        let result = doc.record_outcome(&outcome(2, 2, Decision::Approved));
        assert_eq!(
            result,
            Err(LedgerError::DocumentFinalized {
                status: OverallStatus::Rejected
            })
        );
    }

    #[test]
    fn test_out_of_order_outcome_is_refused() {
        let doc = two_step_document();
        let result = doc.record_outcome(&outcome(2, 2, Decision::Approved));
        assert_eq!(
            result,
            Err(LedgerError::OutOfOrder {
                expected: 1,
                received: 2
            })
        );
    }

    #[test]
    fn test_unknown_step_is_refused() {
        let doc = two_step_document();
        let result = doc.record_outcome(&outcome(3, 2, Decision::Approved));
        assert_eq!(result, Err(LedgerError::UnknownStep { step: 3 }));
        let result = doc.record_outcome(&outcome(0, 2, Decision::Approved));
        assert_eq!(result, Err(LedgerError::UnknownStep { step: 0 }));
    }

    #[test]
    fn test_wrong_approver_is_refused() {
        let doc = two_step_document();
        let result = doc.record_outcome(&outcome(1, 99, Decision::Approved));
        assert!(matches!(result, Err(LedgerError::ApproverMismatch { .. })));
    }

    #[test]
    fn test_history_is_append_only() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Approved));
        record(&mut doc, &outcome(2, 2, Decision::Approved));

        let types: Vec<_> = doc
            .history()
            .iter()
            .map(crate::DomainEvent::event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                "StepApproved",
                "PointerAdvanced",
                "StepApproved",
                "DocumentApproved"
            ]
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut doc = two_step_document();
        record(&mut doc, &outcome(1, 1, Decision::Approved));
        let json = serde_json::to_string(&doc).unwrap();
        let restored: ApprovalDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, restored);
    }
}
