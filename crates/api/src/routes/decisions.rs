//! Processing-side endpoints: approver inboxes and decisions.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::{DocumentId, EmployeeId, SequenceId};
use domain::{Decision, MirroredStepView};
use saga::ErrorKind;
use serde::{Deserialize, Serialize};

use super::{AppState, SagaStore};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub status: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStepResponse {
    pub sequence_id: SequenceId,
    pub document_id: DocumentId,
    pub step: u32,
    pub requester_id: EmployeeId,
    pub title: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl From<MirroredStepView> for PendingStepResponse {
    fn from(view: MirroredStepView) -> Self {
        Self {
            sequence_id: view.sequence_id,
            document_id: view.document_id,
            step: view.step_number,
            requester_id: view.requester_id,
            title: view.title,
            content: view.content,
            received_at: view.received_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DecisionAccepted {
    pub status: &'static str,
}

/// GET /pending/:approver_id — steps waiting on this approver.
#[tracing::instrument(skip(state))]
pub async fn pending<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(approver_id): Path<i64>,
) -> Result<Json<Vec<PendingStepResponse>>, ApiError> {
    let views = state
        .executor
        .list_pending(EmployeeId::new(approver_id))
        .await?;
    Ok(Json(views.into_iter().map(PendingStepResponse::from).collect()))
}

/// POST /decide/:approver_id/:sequence_id — approve or reject the current
/// step of a document.
///
/// A decision that was committed but not yet published still answers
/// `received`; the outbox relay delivers it.
#[tracing::instrument(skip(state, payload))]
pub async fn decide<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path((approver_id, sequence_id)): Path<(i64, i64)>,
    payload: Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<Json<DecisionAccepted>, ApiError> {
    let Json(req) = payload?;
    let decision: Decision = req
        .status
        .parse()
        .map_err(|e: domain::LedgerError| ApiError::BadRequest(e.to_string()))?;

    let result = state
        .executor
        .decide_current(
            SequenceId::new(sequence_id),
            EmployeeId::new(approver_id),
            decision,
            req.comment,
        )
        .await;

    match result {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::Publish => {
            tracing::warn!(error = %e, "decision committed, publish deferred to relay");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Json(DecisionAccepted { status: "received" }))
}
