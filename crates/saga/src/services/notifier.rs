//! End-of-saga notification trait and implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{EmployeeId, SequenceId};
use domain::{ApprovalDocument, OverallStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SagaError;

/// Final result of an approval, delivered to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeNotification {
    pub requester_id: EmployeeId,
    pub sequence_id: SequenceId,
    pub title: String,
    pub final_status: OverallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<EmployeeId>,
}

impl OutcomeNotification {
    /// Builds the notification for a finalized document.
    pub fn for_document(document: &ApprovalDocument) -> Self {
        Self {
            requester_id: document.requester_id(),
            sequence_id: document.sequence_id(),
            title: document.title().to_string(),
            final_status: document.status(),
            rejected_by: document.rejected_by(),
        }
    }
}

/// Best-effort delivery of saga results.
///
/// Failures are logged by the caller and never undo the saga.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_outcome(&self, notification: &OutcomeNotification) -> Result<(), SagaError>;
}

/// Notifier that writes the notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_outcome(&self, notification: &OutcomeNotification) -> Result<(), SagaError> {
        tracing::info!(
            requester_id = %notification.requester_id,
            sequence_id = %notification.sequence_id,
            title = %notification.title,
            final_status = %notification.final_status,
            rejected_by = ?notification.rejected_by.map(|id| id.as_i64()),
            "approval finished"
        );
        Ok(())
    }
}

/// Notifier that records notifications, for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<OutcomeNotification>>>,
    fail_on_notify: Arc<AtomicBool>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every notification to fail.
    pub fn set_fail_on_notify(&self, fail: bool) {
        self.fail_on_notify.store(fail, Ordering::SeqCst);
    }

    /// Returns every notification delivered so far.
    pub async fn sent(&self) -> Vec<OutcomeNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify_outcome(&self, notification: &OutcomeNotification) -> Result<(), SagaError> {
        if self.fail_on_notify.load(Ordering::SeqCst) {
            return Err(SagaError::Transient(
                "notification channel unavailable".to_string(),
            ));
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}
