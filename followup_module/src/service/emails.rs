use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::engine::rules;
use crate::engine::types::{Email, EmailStatus};

use super::error::{blocking, ApiError};
use super::state::AppState;

/// `GET /emails`: newest first.
pub(super) async fn list(State(state): State<AppState>) -> Result<Json<Vec<Email>>, ApiError> {
    let emails = blocking(move || {
        state
            .store
            .list_emails()
            .map_err(|err| ApiError::from_store("list emails", err))
    })
    .await?;
    Ok(Json(emails))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ComposeEmailRequest {
    recipient: String,
    subject: String,
    #[serde(alias = "body")]
    content: String,
    client_id: Option<Uuid>,
}

/// `POST /emails`: send an outreach email and record it as SENT. The scan
/// cycle discovers it for follow-up once the threshold elapses.
pub(super) async fn compose(
    State(state): State<AppState>,
    Json(request): Json<ComposeEmailRequest>,
) -> Result<Json<Email>, ApiError> {
    if request.recipient.trim().is_empty() || !request.recipient.contains('@') {
        return Err(ApiError::BadRequest(
            "recipient must be an email address".to_string(),
        ));
    }
    if request.subject.trim().is_empty() {
        return Err(ApiError::BadRequest("subject is required".to_string()));
    }
    if request.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content is required".to_string()));
    }

    let email = blocking(move || {
        if let Some(client_id) = request.client_id {
            state
                .store
                .get_client(client_id)
                .map_err(|err| ApiError::from_store("load client", err))?
                .ok_or(ApiError::NotFound("client not found"))?;
        }

        let outcome = state
            .mailer
            .send(&request.recipient, &request.subject, &request.content)
            .map_err(|err| {
                error!("outbound send failed: {err}");
                ApiError::Internal
            })?;

        let now = Utc::now();
        let email = Email {
            id: Uuid::new_v4(),
            client_id: request.client_id,
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            body: request.content.clone(),
            status: EmailStatus::Sent,
            thread_id: outcome.thread_id.clone(),
            sent_at: Some(now),
            created_at: now,
        };
        state
            .store
            .insert_email(&email)
            .map_err(|err| ApiError::from_store("record email", err))?;

        if let Some(client_id) = request.client_id {
            let next = rules::next_follow_up_after(now, state.config.follow_up_threshold_days);
            if let Err(err) = state.store.record_client_contact(client_id, now, Some(next)) {
                error!("failed to refresh client {client_id} contact dates: {err}");
            }
        }
        Ok(email)
    })
    .await?;

    Ok(Json(email))
}
