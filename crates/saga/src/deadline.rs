//! Bounded waits for store, broker and collaborator calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SagaError};

/// Upper bounds for calls a saga operation makes while holding a document
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Any single store read or write.
    pub store: Duration,
    /// Participant lookups and notifications.
    pub collaborator: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            store: Duration::from_millis(2000),
            collaborator: Duration::from_millis(2000),
        }
    }
}

/// Runs `future`, failing with [`SagaError::Timeout`] once `limit` elapses.
pub async fn within<F, T, E>(limit: Duration, operation: &'static str, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<SagaError>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            metrics::counter!("saga_timeouts_total", "operation" => operation).increment(1);
            Err(SagaError::Timeout {
                operation,
                millis: limit.as_millis(),
            })
        }
    }
}
