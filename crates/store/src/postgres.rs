use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, MessageId, SequenceId};
use domain::{ApprovalDocument, MirroredStepView, StepStatus};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    OutboxMessage, Result, StoreError, Version, Versioned,
    store::{DocumentStore, OutboxStore, StepViewStore},
};

/// PostgreSQL-backed store implementation.
///
/// Both saga sides may share one database; `source` tags the outbox rows a
/// store instance writes so each relay only sweeps its own messages.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    source: String,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store writing outbox rows under `source`.
    pub fn new(pool: PgPool, source: impl Into<String>) -> Self {
        Self {
            pool,
            source: source.into(),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert_outbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        outbox: &[OutboxMessage],
    ) -> Result<()> {
        for message in outbox {
            sqlx::query(
                r#"
                INSERT INTO outbox (id, source, routing_key, payload, created_at, published_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(message.id.as_uuid())
            .bind(&self.source)
            .bind(&message.routing_key)
            .bind(&message.payload)
            .bind(message.created_at)
            .bind(message.published_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn row_to_document(row: PgRow) -> Result<Versioned<ApprovalDocument>> {
        let body: serde_json::Value = row.try_get("body")?;
        let version: i64 = row.try_get("version")?;
        Ok(Versioned::new(
            serde_json::from_value(body)?,
            Version::new(version),
        ))
    }

    fn row_to_view(row: PgRow) -> Result<Versioned<MirroredStepView>> {
        let body: serde_json::Value = row.try_get("body")?;
        let version: i64 = row.try_get("version")?;
        Ok(Versioned::new(
            serde_json::from_value(body)?,
            Version::new(version),
        ))
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }

    fn map_unique_violation(e: sqlx::Error, key: String) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StoreError::AlreadyExists(key);
        }
        StoreError::Database(e)
    }

    fn conflict(key: String, expected: Version, actual: Option<i64>) -> StoreError {
        match actual {
            None => StoreError::NotFound(key),
            Some(actual) => {
                metrics::counter!("store_concurrency_conflicts_total").increment(1);
                StoreError::ConcurrencyConflict {
                    key,
                    expected,
                    actual: Version::new(actual),
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn next_sequence_id(&self) -> Result<SequenceId> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('approval_sequence_ids')")
            .fetch_one(&self.pool)
            .await?;
        Ok(SequenceId::new(id))
    }

    #[tracing::instrument(skip(self, document, outbox), fields(document_id = %document.id()))]
    async fn insert_document(
        &self,
        document: &ApprovalDocument,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        let body = serde_json::to_value(document)?;
        let version = Version::first();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO approval_documents
                (id, sequence_id, requester_id, overall_status, version, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(document.id().as_uuid())
        .bind(document.sequence_id().as_i64())
        .bind(document.requester_id().as_i64())
        .bind(document.status().as_str())
        .bind(version.as_i64())
        .bind(body)
        .bind(document.created_at())
        .bind(document.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_unique_violation(e, format!("document {}", document.id())))?;

        self.insert_outbox(&mut tx, &outbox).await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Versioned<ApprovalDocument>>> {
        let row = sqlx::query("SELECT version, body FROM approval_documents WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_document).transpose()
    }

    async fn get_document_by_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<ApprovalDocument>>> {
        let row = sqlx::query("SELECT version, body FROM approval_documents WHERE sequence_id = $1")
            .bind(sequence_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_document).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<ApprovalDocument>> {
        let rows =
            sqlx::query("SELECT version, body FROM approval_documents ORDER BY sequence_id ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|row| Self::row_to_document(row).map(Versioned::into_inner))
            .collect()
    }

    #[tracing::instrument(skip(self, document, outbox), fields(document_id = %document.id(), expected = %expected))]
    async fn compare_and_swap_document(
        &self,
        document: &ApprovalDocument,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        let body = serde_json::to_value(document)?;
        let next = expected.next();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE approval_documents
            SET overall_status = $1, version = $2, body = $3, updated_at = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(document.status().as_str())
        .bind(next.as_i64())
        .bind(body)
        .bind(document.updated_at())
        .bind(document.id().as_uuid())
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM approval_documents WHERE id = $1")
                    .bind(document.id().as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(Self::conflict(
                format!("document {}", document.id()),
                expected,
                actual,
            ));
        }

        self.insert_outbox(&mut tx, &outbox).await?;
        tx.commit().await?;

        Ok(next)
    }
}

#[async_trait]
impl StepViewStore for PostgresStore {
    #[tracing::instrument(skip(self, view), fields(document_id = %view.document_id, step = view.step_number))]
    async fn insert_view_if_absent(&self, view: &MirroredStepView) -> Result<bool> {
        let body = serde_json::to_value(view)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO step_views
                (document_id, step_number, sequence_id, approver_id, status, version, body, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (document_id, step_number) DO NOTHING
            "#,
        )
        .bind(view.document_id.as_uuid())
        .bind(view.step_number as i32)
        .bind(view.sequence_id.as_i64())
        .bind(view.approver_id.as_i64())
        .bind(view.status.as_str())
        .bind(Version::first().as_i64())
        .bind(body)
        .bind(view.received_at)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn get_view(
        &self,
        document_id: DocumentId,
        step_number: u32,
    ) -> Result<Option<Versioned<MirroredStepView>>> {
        let row = sqlx::query(
            "SELECT version, body FROM step_views WHERE document_id = $1 AND step_number = $2",
        )
        .bind(document_id.as_uuid())
        .bind(step_number as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_view).transpose()
    }

    async fn current_view_for_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Versioned<MirroredStepView>>> {
        let row = sqlx::query(
            r#"
            SELECT version, body FROM step_views
            WHERE sequence_id = $1
            ORDER BY step_number DESC
            LIMIT 1
            "#,
        )
        .bind(sequence_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_view).transpose()
    }

    async fn list_pending_views(&self, approver_id: EmployeeId) -> Result<Vec<MirroredStepView>> {
        let rows = sqlx::query(
            r#"
            SELECT version, body FROM step_views
            WHERE approver_id = $1 AND status = $2
            ORDER BY sequence_id ASC, step_number ASC
            "#,
        )
        .bind(approver_id.as_i64())
        .bind(StepStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Self::row_to_view(row).map(Versioned::into_inner))
            .collect()
    }

    #[tracing::instrument(skip(self, view, outbox), fields(document_id = %view.document_id, step = view.step_number))]
    async fn compare_and_swap_view(
        &self,
        view: &MirroredStepView,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        let body = serde_json::to_value(view)?;
        let next = expected.next();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE step_views
            SET status = $1, version = $2, body = $3
            WHERE document_id = $4 AND step_number = $5 AND version = $6
            "#,
        )
        .bind(view.status.as_str())
        .bind(next.as_i64())
        .bind(body)
        .bind(view.document_id.as_uuid())
        .bind(view.step_number as i32)
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM step_views WHERE document_id = $1 AND step_number = $2",
            )
            .bind(view.document_id.as_uuid())
            .bind(view.step_number as i32)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Err(Self::conflict(
                format!("step view {}/{}", view.document_id, view.step_number),
                expected,
                actual,
            ));
        }

        self.insert_outbox(&mut tx, &outbox).await?;
        tx.commit().await?;

        Ok(next)
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, routing_key, payload, created_at, published_at
            FROM outbox
            WHERE source = $1 AND published_at IS NULL AND created_at <= $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(&self.source)
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_published(&self, id: MessageId, published_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET published_at = $1 WHERE id = $2 AND published_at IS NULL",
        )
        .bind(published_at)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
