//! Request-side endpoints: submit and inspect approval documents.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, SequenceId};
use domain::{ApprovalDocument, OverallStatus, StepRecord, StepSpec, StepStatus};
use saga::CreateDocument;
use serde::{Deserialize, Serialize};

use super::{AppState, SagaStore};
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalRequest {
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub steps: Vec<StepRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub step: u32,
    pub approver_id: EmployeeId,
}

impl From<CreateApprovalRequest> for CreateDocument {
    fn from(req: CreateApprovalRequest) -> Self {
        CreateDocument {
            requester_id: req.requester_id,
            title: req.title,
            content: req.content,
            steps: req
                .steps
                .into_iter()
                .map(|s| StepSpec::new(s.step, s.approver_id))
                .collect(),
        }
    }
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalCreatedResponse {
    pub sequence_id: SequenceId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub sequence_id: SequenceId,
    pub document_id: DocumentId,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub steps: Vec<StepResponse>,
    pub current_step: u32,
    pub final_status: OverallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<EmployeeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub step: u32,
    pub approver_id: EmployeeId,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl From<&StepRecord> for StepResponse {
    fn from(step: &StepRecord) -> Self {
        Self {
            step: step.step_number,
            approver_id: step.approver_id,
            status: step.status,
            comment: step.comment.clone(),
            decided_at: step.decided_at,
        }
    }
}

impl From<&ApprovalDocument> for ApprovalResponse {
    fn from(doc: &ApprovalDocument) -> Self {
        Self {
            sequence_id: doc.sequence_id(),
            document_id: doc.id(),
            requester_id: doc.requester_id(),
            title: doc.title().to_string(),
            content: doc.content().to_string(),
            steps: doc.steps().iter().map(StepResponse::from).collect(),
            current_step: doc.current_step_number(),
            final_status: doc.status(),
            rejected_by: doc.rejected_by(),
            created_at: doc.created_at(),
            updated_at: doc.updated_at(),
        }
    }
}

// -- Handlers --

/// POST /approvals — submit a new approval document.
#[tracing::instrument(skip_all)]
pub async fn create<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<CreateApprovalRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApprovalCreatedResponse>), ApiError> {
    let Json(req) = payload?;
    let sequence_id = state.coordinator.create_document(req.into()).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApprovalCreatedResponse { sequence_id }),
    ))
}

/// GET /approvals — list every document, oldest first.
#[tracing::instrument(skip(state))]
pub async fn list<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<ApprovalResponse>>, ApiError> {
    let documents = state.coordinator.list_documents().await?;
    Ok(Json(documents.iter().map(ApprovalResponse::from).collect()))
}

/// GET /approvals/:sequence_id — one document with its step ledger.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(sequence_id): Path<i64>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let document = state
        .coordinator
        .get_document(SequenceId::new(sequence_id))
        .await?;
    Ok(Json(ApprovalResponse::from(&document)))
}
