//! Participant directory trait and in-memory implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::EmployeeId;
use tokio::sync::RwLock;

use crate::error::SagaError;

/// Existence check for employees taking part in an approval.
///
/// The answer is authoritative; a lookup error is treated like an unknown
/// participant by the caller.
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    async fn exists(&self, id: EmployeeId) -> Result<bool, SagaError>;
}

/// In-memory participant directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryParticipantDirectory {
    known: Arc<RwLock<HashSet<EmployeeId>>>,
    fail_on_lookup: Arc<AtomicBool>,
}

impl InMemoryParticipantDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory that knows the given ids.
    pub fn with_participants(ids: impl IntoIterator<Item = EmployeeId>) -> Self {
        Self {
            known: Arc::new(RwLock::new(ids.into_iter().collect())),
            fail_on_lookup: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn add(&self, id: EmployeeId) {
        self.known.write().await.insert(id);
    }

    pub async fn remove(&self, id: EmployeeId) {
        self.known.write().await.remove(&id);
    }

    /// Configures every lookup to fail as if the directory were unreachable.
    pub fn set_fail_on_lookup(&self, fail: bool) {
        self.fail_on_lookup.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ParticipantDirectory for InMemoryParticipantDirectory {
    async fn exists(&self, id: EmployeeId) -> Result<bool, SagaError> {
        if self.fail_on_lookup.load(Ordering::SeqCst) {
            return Err(SagaError::Transient(format!(
                "participant directory unreachable while checking {id}"
            )));
        }
        Ok(self.known.read().await.contains(&id))
    }
}
