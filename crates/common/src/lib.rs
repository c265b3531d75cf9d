//! Identifier types shared by both sides of the approval saga.

mod types;

pub use types::{DocumentId, EmployeeId, MessageId, SequenceId};
