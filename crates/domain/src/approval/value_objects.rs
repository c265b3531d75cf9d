//! Value objects for approval documents.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::EmployeeId;
use serde::{Deserialize, Serialize};

use super::{LedgerError, StepStatus};

/// A decision an approver can make on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = LedgerError;

    /// Parses `approved` / `rejected`, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("approved") {
            Ok(Decision::Approved)
        } else if s.eq_ignore_ascii_case("rejected") {
            Ok(Decision::Rejected)
        } else {
            Err(LedgerError::InvalidDecision(s.to_string()))
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A requested step, as supplied when a document is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_number: u32,
    pub approver_id: EmployeeId,
}

impl StepSpec {
    pub fn new(step_number: u32, approver_id: impl Into<EmployeeId>) -> Self {
        Self {
            step_number,
            approver_id: approver_id.into(),
        }
    }
}

/// One step of the canonical ledger.
///
/// Once `status` leaves `Pending` the record is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub status: StepStatus,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Creates a pending step record from its spec.
    pub fn pending(spec: StepSpec) -> Self {
        Self {
            step_number: spec.step_number,
            approver_id: spec.approver_id,
            status: StepStatus::Pending,
            comment: None,
            decided_at: None,
        }
    }
}

/// The decision of one step as reported by the Processing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step_number: u32,
    pub approver_id: EmployeeId,
    pub decision: Decision,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Validates a requested step list.
///
/// Step numbers must be exactly `1..=N` in order, with no gaps or
/// duplicates, and every approver id must be positive.
pub fn validate_steps(steps: &[StepSpec]) -> Result<(), LedgerError> {
    if steps.is_empty() {
        return Err(LedgerError::EmptySteps);
    }

    for (index, spec) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if spec.step_number != expected {
            return Err(LedgerError::NonContiguousSteps {
                expected,
                found: spec.step_number,
            });
        }
        if spec.approver_id.as_i64() <= 0 {
            return Err(LedgerError::InvalidParticipant(spec.approver_id));
        }
    }

    Ok(())
}
