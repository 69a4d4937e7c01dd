use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::crm_store::StoreError;
use crate::engine::rules;
use crate::engine::types::{FollowUp, FollowUpDetails, FollowUpStatus};
use crate::task_queue::{JobKind, TaskQueue};

use super::error::{blocking, ApiError};
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    status: Option<String>,
}

/// `GET /follow-ups?status=`: follow-ups joined with email and client.
pub(super) async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FollowUpDetails>>, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<FollowUpStatus>()
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ),
        None => None,
    };

    let follow_ups = blocking(move || {
        state
            .store
            .list_follow_ups(status)
            .map_err(|err| ApiError::from_store("list follow-ups", err))
    })
    .await?;
    Ok(Json(follow_ups))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateFollowUpRequest {
    email_id: Uuid,
    client_id: Option<Uuid>,
    content: Option<String>,
    scheduled_for: Option<DateTime<Utc>>,
}

/// `POST /follow-ups`: create a pending follow-up for an email and queue
/// its processing job. A concurrent duplicate returns the existing row.
pub(super) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateFollowUpRequest>,
) -> Result<Json<FollowUp>, ApiError> {
    let follow_up = blocking(move || {
        let email = state
            .store
            .get_email(request.email_id)
            .map_err(|err| ApiError::from_store("load email", err))?
            .ok_or(ApiError::NotFound("email not found"))?;

        let now = Utc::now();
        let scheduled_at = request.scheduled_for.unwrap_or_else(|| {
            rules::next_follow_up_after(now, state.config.follow_up_threshold_days)
        });
        let follow_up = FollowUp {
            id: Uuid::new_v4(),
            email_id: email.id,
            client_id: request.client_id.or(email.client_id),
            content: request.content.clone().filter(|text| !text.trim().is_empty()),
            status: FollowUpStatus::Pending,
            scheduled_at,
            created_at: now,
        };

        let follow_up = match state.store.create_follow_up(&follow_up) {
            Ok(()) => follow_up,
            Err(StoreError::Conflict) => state
                .store
                .get_pending_follow_up(email.id)
                .map_err(|err| ApiError::from_store("load pending follow-up", err))?
                .ok_or(ApiError::Internal)?,
            Err(err) => return Err(ApiError::from_store("create follow-up", err)),
        };

        let job = JobKind::FollowUp { email_id: email.id };
        if let Err(err) = state.queue.enqueue(&job) {
            // The scan cycle will re-discover this email; creation stands.
            error!("failed to enqueue follow-up job for email {}: {err}", email.id);
        }
        Ok(follow_up)
    })
    .await?;

    Ok(Json(follow_up))
}

#[derive(Debug, Deserialize)]
pub(super) struct SendFollowUpRequest {
    id: Uuid,
}

/// `PUT /follow-ups`: the explicit, reviewed send of a drafted follow-up.
pub(super) async fn send(
    State(state): State<AppState>,
    Json(request): Json<SendFollowUpRequest>,
) -> Result<Json<FollowUp>, ApiError> {
    let follow_up = blocking(move || {
        state
            .engine
            .send_follow_up(request.id)
            .map_err(|err| ApiError::from_engine("send follow-up", err))
    })
    .await?;
    Ok(Json(follow_up))
}
