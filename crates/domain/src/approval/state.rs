//! Step and document state machines.

use serde::{Deserialize, Serialize};

use super::Decision;

/// Status of a single approval step.
///
/// Shared by the canonical ledger and the Processing side's mirrored view.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Approved
///           └──► Rejected
/// ```
/// Both decided states are terminal; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Awaiting a decision.
    #[default]
    Pending,

    /// Approved by the assigned approver (terminal).
    Approved,

    /// Rejected by the assigned approver (terminal).
    Rejected,
}

impl StepStatus {
    /// Returns true if a decision may still be recorded for this step.
    pub fn can_decide(&self) -> bool {
        matches!(self, StepStatus::Pending)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.can_decide()
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
        }
    }
}

impl From<Decision> for StepStatus {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approved => StepStatus::Approved,
            Decision::Rejected => StepStatus::Rejected,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall outcome of an approval document.
///
/// State transitions:
/// ```text
/// InProgress ──┬──► Approved
///              └──► Rejected
/// ```
/// Terminal once approved or rejected; never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Steps are still being decided.
    #[default]
    InProgress,

    /// Every step was approved (terminal).
    Approved,

    /// One step was rejected (terminal).
    Rejected,
}

impl OverallStatus {
    /// Returns true while the saga is still running.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, OverallStatus::InProgress)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::InProgress => "in_progress",
            OverallStatus::Approved => "approved",
            OverallStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
