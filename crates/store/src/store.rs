use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, MessageId, SequenceId};
use domain::{ApprovalDocument, MirroredStepView};

use crate::{OutboxMessage, Result, Version, Versioned};

/// Storage for canonical approval documents (Request side).
///
/// All implementations must be thread-safe (Send + Sync). Writes are
/// atomic: the document and its outbox batch are committed together or not
/// at all.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Allocates the next human-facing sequence id.
    ///
    /// Ids are strictly increasing; an id handed out for a creation that
    /// later fails is not reused.
    async fn next_sequence_id(&self) -> Result<SequenceId>;

    /// Stores a new document at version 1.
    ///
    /// Fails with `AlreadyExists` if the id or sequence id is taken.
    async fn insert_document(
        &self,
        document: &ApprovalDocument,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Versioned<ApprovalDocument>>>;

    async fn get_document_by_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<ApprovalDocument>>>;

    /// Lists every document ordered by sequence id.
    async fn list_documents(&self) -> Result<Vec<ApprovalDocument>>;

    /// Replaces a document if it is still at `expected`.
    ///
    /// Fails with `ConcurrencyConflict` otherwise. Returns the new version.
    async fn compare_and_swap_document(
        &self,
        document: &ApprovalDocument,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version>;
}

/// Storage for mirrored step views (Processing side).
#[async_trait]
pub trait StepViewStore: Send + Sync {
    /// Stores a view unless one already exists for its
    /// `(document_id, step_number)`.
    ///
    /// Returns false, leaving the stored view untouched, for a duplicate.
    async fn insert_view_if_absent(&self, view: &MirroredStepView) -> Result<bool>;

    async fn get_view(
        &self,
        document_id: DocumentId,
        step_number: u32,
    ) -> Result<Option<Versioned<MirroredStepView>>>;

    /// Returns the view with the highest step number for a document.
    async fn current_view_for_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<MirroredStepView>>>;

    /// Lists pending views assigned to an approver, ordered by sequence id.
    async fn list_pending_views(&self, approver_id: EmployeeId) -> Result<Vec<MirroredStepView>>;

    /// Replaces a view if it is still at `expected`, committing the outbox
    /// batch in the same step.
    async fn compare_and_swap_view(
        &self,
        view: &MirroredStepView,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version>;
}

/// Transactional outbox shared by both sides' stores.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns unpublished messages created at or before `older_than`,
    /// oldest first.
    async fn pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>>;

    /// Marks a message published. Marking twice is a no-op.
    async fn mark_published(&self, id: MessageId, published_at: DateTime<Utc>) -> Result<()>;
}
