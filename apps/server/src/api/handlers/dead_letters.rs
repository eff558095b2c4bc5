use crate::api::response::ApiResponse;
use crate::envelope::MessageStatus;
use crate::error::{Error, FailureClass, Result};
use crate::pipeline::{DeadLetterKind, DeadLetterRecord, ProcessingOutcome, Stage};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub kind: Option<DeadLetterKind>,
}

/// Listing row; the full record (with raw content) is served per id.
#[derive(Debug, Serialize)]
pub struct DeadLetterSummary {
    pub id: Uuid,
    pub kind: DeadLetterKind,
    pub route: String,
    pub correlation_id: Uuid,
    pub message_type: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub failure_class: FailureClass,
    pub failed_stage: Stage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl From<&DeadLetterRecord> for DeadLetterSummary {
    fn from(record: &DeadLetterRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            route: record.route.clone(),
            correlation_id: record.envelope.correlation_id(),
            message_type: record.envelope.header().message_type().map(str::to_string),
            status: record.envelope.status(),
            retry_count: record.envelope.retry_count(),
            failure_class: record.failure_class,
            failed_stage: record.failed_stage,
            reason: record.reason.clone(),
            failed_at: record.failed_at,
        }
    }
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<DeadLetterSummary>>>> {
    let records = state.orchestrator.dead_letters().list(query.kind).await?;
    let summaries = records.iter().map(DeadLetterSummary::from).collect();
    Ok(Json(ApiResponse::success(summaries)))
}

pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<DeadLetterRecord>>> {
    let record = state
        .orchestrator
        .dead_letters()
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("dead-letter record {}", id)))?;
    Ok(Json(ApiResponse::success(record)))
}

/// Resubmit a record's raw content and wait for the new outcome.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ProcessingOutcome>>> {
    let outcome = state.orchestrator.replay(id, &state.intake).await?;
    let message = format!("replayed as {}", outcome.message_id);
    Ok(Json(ApiResponse::success(outcome).with_message(message)))
}
