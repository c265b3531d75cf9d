//! Approval documents, their step ledger, and the Processing side's
//! mirrored step views.

mod document;
mod events;
mod state;
mod value_objects;
mod view;

pub use document::{ApprovalDocument, NewDocument};
pub use events::{
    DocumentFinalizedData, DocumentRejectedData, LedgerEvent, PointerAdvancedData,
    StepDecidedData,
};
pub use state::{OverallStatus, StepStatus};
pub use value_objects::{Decision, StepOutcome, StepRecord, StepSpec, validate_steps};
pub use view::{MirroredStepView, NewStepView};

use common::EmployeeId;
use thiserror::Error;

/// Errors raised by ledger and step-view transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The document has no steps.
    #[error("Approval steps must not be empty")]
    EmptySteps,

    /// Step numbers are not exactly 1..N.
    #[error("Step numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguousSteps { expected: u32, found: u32 },

    /// A requester or approver id is not a valid employee id.
    #[error("Invalid participant id: {0}")]
    InvalidParticipant(EmployeeId),

    /// A required text field is blank.
    #[error("Field '{0}' must not be blank")]
    BlankField(&'static str),

    /// A decision other than approved/rejected.
    #[error("Invalid decision: '{0}' (expected 'approved' or 'rejected')")]
    InvalidDecision(String),

    /// The outcome refers to a step the document does not have.
    #[error("Unknown step: {step}")]
    UnknownStep { step: u32 },

    /// The document already reached a terminal status.
    #[error("Document is already {status}")]
    DocumentFinalized { status: OverallStatus },

    /// The outcome is for a step other than the one awaiting action.
    #[error("Out-of-order outcome: current step is {expected}, received step {received}")]
    OutOfOrder { expected: u32, received: u32 },

    /// The outcome or decision comes from someone other than the assigned approver.
    #[error("Step {step} is assigned to approver {expected}, not {actual}")]
    ApproverMismatch {
        step: u32,
        expected: EmployeeId,
        actual: EmployeeId,
    },

    /// The step was already decided.
    #[error("Step {step} is already {status}")]
    StepAlreadyDecided { step: u32, status: StepStatus },
}
