use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use super::error::{blocking, ApiError};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub(super) struct AnalyticsResponse {
    #[serde(rename = "type")]
    kind: String,
    data: BTreeMap<String, i64>,
}

/// `GET /analytics/:type` for `emails | follow-ups | replies`: counts
/// grouped by status.
pub(super) async fn counts(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let data = match kind.as_str() {
        "emails" => {
            blocking(move || {
                state
                    .store
                    .email_counts_by_status()
                    .map_err(|err| ApiError::from_store("email analytics", err))
            })
            .await?
        }
        "follow-ups" => {
            blocking(move || {
                state
                    .store
                    .follow_up_counts_by_status()
                    .map_err(|err| ApiError::from_store("follow-up analytics", err))
            })
            .await?
        }
        "replies" => {
            blocking(move || {
                let replied = state
                    .store
                    .replied_email_count()
                    .map_err(|err| ApiError::from_store("reply analytics", err))?;
                Ok(BTreeMap::from([("REPLIED".to_string(), replied)]))
            })
            .await?
        }
        _ => return Err(ApiError::BadRequest("invalid analytics type".to_string())),
    };

    Ok(Json(AnalyticsResponse { kind, data }))
}
