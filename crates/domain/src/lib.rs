//! Domain layer for the approval saga.
//!
//! This crate provides:
//! - `ApprovalDocument`, the canonical step ledger owned by the Request side
//! - `MirroredStepView`, the Processing side's derivative copy of one step
//! - The step state machine shared by both (`pending -> approved | rejected`)
//! - `LedgerEvent`, the append-only audit trail of every applied transition
//!
//! Everything here is pure: no I/O, no clocks read implicitly. Timestamps
//! are passed in by the caller so transitions stay deterministic.

pub mod approval;
pub mod event;

pub use approval::{
    ApprovalDocument, Decision, DocumentFinalizedData, DocumentRejectedData, LedgerError,
    LedgerEvent, MirroredStepView, NewDocument, NewStepView, OverallStatus, PointerAdvancedData,
    StepDecidedData, StepOutcome, StepRecord, StepSpec, StepStatus, validate_steps,
};
pub use event::DomainEvent;
