//! Ledger events: the audit trail of an approval document.

use chrono::{DateTime, Utc};
use common::EmployeeId;
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

/// Transitions recorded on an approval document.
///
/// A document never deletes or rewrites an entry; the sequence of events is
/// the document's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerEvent {
    /// A step was approved.
    StepApproved(StepDecidedData),

    /// A step was rejected.
    StepRejected(StepDecidedData),

    /// The step pointer moved to the next pending step.
    PointerAdvanced(PointerAdvancedData),

    /// Every step was approved.
    DocumentApproved(DocumentFinalizedData),

    /// A step was rejected, ending the document.
    DocumentRejected(DocumentRejectedData),
}

impl DomainEvent for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::StepApproved(_) => "StepApproved",
            LedgerEvent::StepRejected(_) => "StepRejected",
            LedgerEvent::PointerAdvanced(_) => "PointerAdvanced",
            LedgerEvent::DocumentApproved(_) => "DocumentApproved",
            LedgerEvent::DocumentRejected(_) => "DocumentRejected",
        }
    }
}

/// Data for StepApproved / StepRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDecidedData {
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Data for PointerAdvanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerAdvancedData {
    pub from: u32,
    pub to: u32,
    pub advanced_at: DateTime<Utc>,
}

/// Data for DocumentApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFinalizedData {
    pub finalized_at: DateTime<Utc>,
}

/// Data for DocumentRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRejectedData {
    pub rejected_step: u32,
    pub rejected_by: EmployeeId,
    pub finalized_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn step_approved(
        step_number: u32,
        approver_id: EmployeeId,
        comment: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        LedgerEvent::StepApproved(StepDecidedData {
            step_number,
            approver_id,
            comment,
            decided_at,
        })
    }

    pub fn step_rejected(
        step_number: u32,
        approver_id: EmployeeId,
        comment: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        LedgerEvent::StepRejected(StepDecidedData {
            step_number,
            approver_id,
            comment,
            decided_at,
        })
    }

    pub fn pointer_advanced(from: u32, to: u32, advanced_at: DateTime<Utc>) -> Self {
        LedgerEvent::PointerAdvanced(PointerAdvancedData {
            from,
            to,
            advanced_at,
        })
    }

    pub fn document_approved(finalized_at: DateTime<Utc>) -> Self {
        LedgerEvent::DocumentApproved(DocumentFinalizedData { finalized_at })
    }

    pub fn document_rejected(
        rejected_step: u32,
        rejected_by: EmployeeId,
        finalized_at: DateTime<Utc>,
    ) -> Self {
        LedgerEvent::DocumentRejected(DocumentRejectedData {
            rejected_step,
            rejected_by,
            finalized_at,
        })
    }

    /// Returns the time the transition happened.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::StepApproved(data) | LedgerEvent::StepRejected(data) => data.decided_at,
            LedgerEvent::PointerAdvanced(data) => data.advanced_at,
            LedgerEvent::DocumentApproved(data) => data.finalized_at,
            LedgerEvent::DocumentRejected(data) => data.finalized_at,
        }
    }
}
