//! Saga error types.

use domain::LedgerError;
use store::StoreError;
use thiserror::Error;

use crate::broker::BrokerError;

/// Error category, used to decide between retry and park for broker
/// deliveries and to pick an HTTP status for REST callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input. Never retried.
    Validation,
    /// The document or step does not exist.
    NotFound,
    /// The actor is not the step's assigned approver.
    Forbidden,
    /// The step or document is not in a state that allows the transition.
    Conflict,
    /// Store or broker trouble. Retried through redelivery.
    Transient,
    /// The local commit happened; the outbound message did not go out.
    Publish,
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Invalid input or an unknown participant.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Document or step not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Decision by someone other than the assigned approver.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Step not pending, stale decision, or out-of-order outcome.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A collaborator or piece of infrastructure is unavailable.
    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    /// A bounded operation did not finish in time.
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: &'static str, millis: u128 },

    /// Outbound message failed after the state change was committed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Ledger transition refused.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker error outside of publishing (receive, ack, nack).
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Malformed message payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Validation(_) | SagaError::Serialization(_) => ErrorKind::Validation,
            SagaError::NotFound(_) => ErrorKind::NotFound,
            SagaError::Forbidden(_) => ErrorKind::Forbidden,
            SagaError::Conflict(_) => ErrorKind::Conflict,
            SagaError::Transient(_)
            | SagaError::Timeout { .. }
            | SagaError::Store(_)
            | SagaError::Broker(_) => ErrorKind::Transient,
            SagaError::Publish(_) => ErrorKind::Publish,
            SagaError::Ledger(e) => match e {
                LedgerError::EmptySteps
                | LedgerError::NonContiguousSteps { .. }
                | LedgerError::InvalidParticipant(_)
                | LedgerError::BlankField(_)
                | LedgerError::InvalidDecision(_) => ErrorKind::Validation,
                LedgerError::UnknownStep { .. } => ErrorKind::NotFound,
                LedgerError::ApproverMismatch { .. } => ErrorKind::Forbidden,
                LedgerError::DocumentFinalized { .. }
                | LedgerError::OutOfOrder { .. }
                | LedgerError::StepAlreadyDecided { .. } => ErrorKind::Conflict,
            },
        }
    }

    /// True only for infrastructure failures worth a redelivery.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::EmployeeId;
    use domain::StepStatus;
    use store::Version;

    #[test]
    fn test_ledger_errors_map_to_business_kinds() {
        let forbidden = SagaError::from(LedgerError::ApproverMismatch {
            step: 1,
            expected: EmployeeId::new(1),
            actual: EmployeeId::new(2),
        });
        assert_eq!(forbidden.kind(), ErrorKind::Forbidden);

        let conflict = SagaError::from(LedgerError::StepAlreadyDecided {
            step: 1,
            status: StepStatus::Approved,
        });
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let out_of_order = SagaError::from(LedgerError::OutOfOrder {
            expected: 2,
            received: 1,
        });
        assert_eq!(out_of_order.kind(), ErrorKind::Conflict);
        assert!(!out_of_order.is_retryable());

        let invalid = SagaError::from(LedgerError::EmptySteps);
        assert_eq!(invalid.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_store_errors_are_retryable() {
        let err = SagaError::from(StoreError::ConcurrencyConflict {
            key: "document".to_string(),
            expected: Version::first(),
            actual: Version::new(2),
        });
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());

        let timeout = SagaError::Timeout {
            operation: "store",
            millis: 10,
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_publish_is_not_retryable() {
        let err = SagaError::Publish("broker down".to_string());
        assert_eq!(err.kind(), ErrorKind::Publish);
        assert!(!err.is_retryable());
    }
}
