//! Per-document mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use common::DocumentId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async mutex per document.
///
/// Transitions on the same document run one at a time; different documents
/// never contend. A guard releases its lock when dropped, on every exit
/// path.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    locks: Arc<Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `document_id`.
    pub async fn acquire(&self, document_id: DocumentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries only the registry still references are idle.
            locks.retain(|id, lock| *id == document_id || Arc::strong_count(lock) > 1);
            locks.entry(document_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Returns the number of documents with a live lock entry.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
