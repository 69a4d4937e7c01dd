use ai_module::ReplyAnalysis;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::engine::reconcile::ReplyEvent;
use crate::engine::types::Email;

use super::error::{blocking, ApiError};
use super::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReplyResponse {
    message: &'static str,
    analysis: ReplyAnalysis,
    cancelled_follow_ups: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_reply: Option<Email>,
}

/// `POST /replies`: reconcile an inbound reply against its thread.
pub(super) async fn ingest(
    State(state): State<AppState>,
    Json(event): Json<ReplyEvent>,
) -> Result<Json<ReplyResponse>, ApiError> {
    if event.thread_id.trim().is_empty() {
        return Err(ApiError::BadRequest("threadId is required".to_string()));
    }
    if event.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content is required".to_string()));
    }

    let outcome = blocking(move || {
        state
            .engine
            .reconcile_reply(&event)
            .map_err(|err| ApiError::from_engine("reply reconciliation", err))
    })
    .await?;

    Ok(Json(ReplyResponse {
        message: "Reply processed",
        analysis: outcome.analysis,
        cancelled_follow_ups: outcome.cancelled_follow_ups,
        chain_reply: outcome.chain_reply,
    }))
}
