use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, MessageId, SequenceId};
use domain::{ApprovalDocument, MirroredStepView};
use tokio::sync::RwLock;

use crate::{
    OutboxMessage, Result, StoreError, Version, Versioned,
    store::{DocumentStore, OutboxStore, StepViewStore},
};

#[derive(Default)]
struct InMemoryState {
    documents: HashMap<DocumentId, Versioned<ApprovalDocument>>,
    by_sequence: BTreeMap<SequenceId, DocumentId>,
    views: BTreeMap<(DocumentId, u32), Versioned<MirroredStepView>>,
    /// Unpublished messages only, in commit order.
    outbox: Vec<OutboxMessage>,
    last_sequence: i64,
}

/// In-memory store implementation for testing and single-process runs.
///
/// Every write happens inside one write-lock critical section, so a state
/// change and its outbox batch are always visible together.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<InMemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `Unavailable` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the outbox messages not yet published, in commit order.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.state.read().await.outbox.clone()
    }

    /// Returns the total number of stored step views.
    pub async fn view_count(&self) -> usize {
        self.state.read().await.views.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store is failing writes".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn next_sequence_id(&self) -> Result<SequenceId> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.last_sequence += 1;
        Ok(SequenceId::new(state.last_sequence))
    }

    async fn insert_document(
        &self,
        document: &ApprovalDocument,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        if state.documents.contains_key(&document.id()) {
            return Err(StoreError::AlreadyExists(format!(
                "document {}",
                document.id()
            )));
        }
        if state.by_sequence.contains_key(&document.sequence_id()) {
            return Err(StoreError::AlreadyExists(format!(
                "sequence {}",
                document.sequence_id()
            )));
        }

        let version = Version::first();
        state
            .by_sequence
            .insert(document.sequence_id(), document.id());
        state
            .documents
            .insert(document.id(), Versioned::new(document.clone(), version));
        state.outbox.extend(outbox);

        Ok(version)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Versioned<ApprovalDocument>>> {
        let state = self.state.read().await;
        Ok(state.documents.get(&id).cloned())
    }

    async fn get_document_by_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<ApprovalDocument>>> {
        let state = self.state.read().await;
        Ok(state
            .by_sequence
            .get(&sequence_id)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<ApprovalDocument>> {
        let state = self.state.read().await;
        Ok(state
            .by_sequence
            .values()
            .filter_map(|id| state.documents.get(id))
            .map(|v| v.value.clone())
            .collect())
    }

    async fn compare_and_swap_document(
        &self,
        document: &ApprovalDocument,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let current = state
            .documents
            .get(&document.id())
            .map(|v| v.version)
            .unwrap_or(Version::initial());

        if current == Version::initial() {
            return Err(StoreError::NotFound(format!("document {}", document.id())));
        }
        if current != expected {
            return Err(StoreError::ConcurrencyConflict {
                key: format!("document {}", document.id()),
                expected,
                actual: current,
            });
        }

        let version = current.next();
        state
            .documents
            .insert(document.id(), Versioned::new(document.clone(), version));
        state.outbox.extend(outbox);

        Ok(version)
    }
}

#[async_trait]
impl StepViewStore for InMemoryStore {
    async fn insert_view_if_absent(&self, view: &MirroredStepView) -> Result<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let key = (view.document_id, view.step_number);
        if state.views.contains_key(&key) {
            return Ok(false);
        }
        state
            .views
            .insert(key, Versioned::new(view.clone(), Version::first()));
        Ok(true)
    }

    async fn get_view(
        &self,
        document_id: DocumentId,
        step_number: u32,
    ) -> Result<Option<Versioned<MirroredStepView>>> {
        let state = self.state.read().await;
        Ok(state.views.get(&(document_id, step_number)).cloned())
    }

    async fn current_view_for_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<MirroredStepView>>> {
        let state = self.state.read().await;
        Ok(state
            .views
            .values()
            .filter(|v| v.value.sequence_id == sequence_id)
            .max_by_key(|v| v.value.step_number)
            .cloned())
    }

    async fn list_pending_views(&self, approver_id: EmployeeId) -> Result<Vec<MirroredStepView>> {
        let state = self.state.read().await;
        let mut views: Vec<_> = state
            .views
            .values()
            .filter(|v| v.value.approver_id == approver_id && v.value.is_pending())
            .map(|v| v.value.clone())
            .collect();
        views.sort_by_key(|v| (v.sequence_id, v.step_number));
        Ok(views)
    }

    async fn compare_and_swap_view(
        &self,
        view: &MirroredStepView,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let key = (view.document_id, view.step_number);
        let current = state
            .views
            .get(&key)
            .map(|v| v.version)
            .unwrap_or(Version::initial());

        if current == Version::initial() {
            return Err(StoreError::NotFound(format!(
                "step view {}/{}",
                view.document_id, view.step_number
            )));
        }
        if current != expected {
            return Err(StoreError::ConcurrencyConflict {
                key: format!("step view {}/{}", view.document_id, view.step_number),
                expected,
                actual: current,
            });
        }

        let version = current.next();
        state
            .views
            .insert(key, Versioned::new(view.clone(), version));
        state.outbox.extend(outbox);

        Ok(version)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.created_at <= older_than)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Published messages are dropped; nothing reads them again.
    async fn mark_published(&self, id: MessageId, _published_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.outbox.retain(|m| m.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Decision, NewDocument, NewStepView, StepSpec};

    fn document(sequence: i64) -> ApprovalDocument {
        ApprovalDocument::create(
            NewDocument {
                id: DocumentId::new(),
                sequence_id: SequenceId::new(sequence),
                requester_id: EmployeeId::new(1),
                title: "Title".to_string(),
                content: "Content".to_string(),
                steps: vec![StepSpec::new(1, 10), StepSpec::new(2, 20)],
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn view(document_id: DocumentId, sequence: i64, step: u32, approver: i64) -> MirroredStepView {
        MirroredStepView::pending(
            NewStepView {
                document_id,
                sequence_id: SequenceId::new(sequence),
                step_number: step,
                approver_id: EmployeeId::new(approver),
                requester_id: EmployeeId::new(1),
                title: "Title".to_string(),
                content: "Content".to_string(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn sequence_ids_increase() {
        let store = InMemoryStore::new();
        let a = store.next_sequence_id().await.unwrap();
        let b = store.next_sequence_id().await.unwrap();
        assert_eq!(a, SequenceId::new(1));
        assert_eq!(b, SequenceId::new(2));
    }

    #[tokio::test]
    async fn insert_and_get_document() {
        let store = InMemoryStore::new();
        let doc = document(1);
        let outbox = vec![OutboxMessage::new("approval.request", serde_json::json!({}))];

        let version = store.insert_document(&doc, outbox).await.unwrap();
        assert_eq!(version, Version::first());

        let loaded = store.get_document(doc.id()).await.unwrap().unwrap();
        assert_eq!(loaded.value, doc);
        assert_eq!(loaded.version, Version::first());

        let by_seq = store
            .get_document_by_sequence(SequenceId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_seq.value.id(), doc.id());
        assert_eq!(store.outbox_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_refused() {
        let store = InMemoryStore::new();
        let doc = document(1);
        store.insert_document(&doc, vec![]).await.unwrap();

        let result = store.insert_document(&doc, vec![]).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn compare_and_swap_requires_expected_version() {
        let store = InMemoryStore::new();
        let doc = document(1);
        store.insert_document(&doc, vec![]).await.unwrap();

        let v2 = store
            .compare_and_swap_document(&doc, Version::first(), vec![])
            .await
            .unwrap();
        assert_eq!(v2, Version::new(2));

        let stale = store
            .compare_and_swap_document(
                &doc,
                Version::first(),
                vec![OutboxMessage::new("approval.request", serde_json::json!({}))],
            )
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
        // The losing write's outbox batch is not committed.
        assert!(store.outbox_messages().await.is_empty());
    }

    #[tokio::test]
    async fn compare_and_swap_unknown_document() {
        let store = InMemoryStore::new();
        let result = store
            .compare_and_swap_document(&document(1), Version::first(), vec![])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_documents_orders_by_sequence() {
        let store = InMemoryStore::new();
        let second = document(2);
        let first = document(1);
        store.insert_document(&second, vec![]).await.unwrap();
        store.insert_document(&first, vec![]).await.unwrap();

        let docs = store.list_documents().await.unwrap();
        let seqs: Vec<_> = docs.iter().map(|d| d.sequence_id().as_i64()).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn view_insert_is_idempotent() {
        let store = InMemoryStore::new();
        let doc_id = DocumentId::new();
        let v = view(doc_id, 1, 1, 10);

        assert!(store.insert_view_if_absent(&v).await.unwrap());
        assert!(!store.insert_view_if_absent(&v).await.unwrap());
        assert_eq!(store.view_count().await, 1);
    }

    #[tokio::test]
    async fn current_view_is_highest_step() {
        let store = InMemoryStore::new();
        let doc_id = DocumentId::new();
        store
            .insert_view_if_absent(&view(doc_id, 4, 1, 10))
            .await
            .unwrap();
        store
            .insert_view_if_absent(&view(doc_id, 4, 2, 20))
            .await
            .unwrap();

        let current = store
            .current_view_for_sequence(SequenceId::new(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.value.step_number, 2);
        assert!(
            store
                .current_view_for_sequence(SequenceId::new(5))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn pending_views_exclude_decided() {
        let store = InMemoryStore::new();
        let doc_a = DocumentId::new();
        let doc_b = DocumentId::new();
        store
            .insert_view_if_absent(&view(doc_a, 1, 1, 10))
            .await
            .unwrap();
        store
            .insert_view_if_absent(&view(doc_b, 2, 1, 10))
            .await
            .unwrap();

        let mut decided = store.get_view(doc_a, 1).await.unwrap().unwrap();
        decided
            .value
            .decide(EmployeeId::new(10), Decision::Approved, None, Utc::now())
            .unwrap();
        store
            .compare_and_swap_view(&decided.value, decided.version, vec![])
            .await
            .unwrap();

        let pending = store
            .list_pending_views(EmployeeId::new(10))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].document_id, doc_b);
    }

    #[tokio::test]
    async fn outbox_pending_and_mark_published() {
        let store = InMemoryStore::new();
        let doc = document(1);
        let message = OutboxMessage::new("approval.request", serde_json::json!({"n": 1}));
        let id = message.id;
        store.insert_document(&doc, vec![message]).await.unwrap();

        let pending = store.pending_outbox(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_published(id, Utc::now()).await.unwrap();
        store.mark_published(id, Utc::now()).await.unwrap();
        assert!(store.pending_outbox(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn published_messages_leave_the_outbox() {
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for seq in 1..=50 {
            let message = OutboxMessage::new("approval.request", serde_json::json!({"n": seq}));
            ids.push(message.id);
            store
                .insert_document(&document(seq), vec![message])
                .await
                .unwrap();
        }
        assert_eq!(store.outbox_messages().await.len(), 50);

        for id in ids.iter().take(49) {
            store.mark_published(*id, Utc::now()).await.unwrap();
        }
        let remaining = store.outbox_messages().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, ids[49]);

        store.mark_published(ids[49], Utc::now()).await.unwrap();
        assert!(store.outbox_messages().await.is_empty());
    }

    #[tokio::test]
    async fn outbox_respects_age_cutoff() {
        let store = InMemoryStore::new();
        let doc = document(1);
        let message = OutboxMessage::new("approval.request", serde_json::json!({}));
        let created = message.created_at;
        store.insert_document(&doc, vec![message]).await.unwrap();

        let too_early = created - chrono::Duration::seconds(1);
        assert!(store.pending_outbox(too_early, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_writes_surface_unavailable() {
        let store = InMemoryStore::new();
        store.set_fail_writes(true);
        let result = store.insert_document(&document(1), vec![]).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_fail_writes(false);
        assert!(store.insert_document(&document(1), vec![]).await.is_ok());
    }
}
