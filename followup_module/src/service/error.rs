//! HTTP error mapping. Responses carry generic messages; the detail stays in
//! the logs with request context.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::crm_store::StoreError;
use crate::engine::types::EngineError;

#[derive(Debug)]
pub(super) enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(&'static str),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message.to_string()),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl ApiError {
    pub(super) fn from_store(context: &str, err: StoreError) -> Self {
        error!("{context}: {err}");
        ApiError::Internal
    }

    /// Lifecycle preconditions surface as client errors; adapter and store
    /// failures stay internal (and retryable).
    pub(super) fn from_engine(context: &str, err: EngineError) -> Self {
        match err {
            EngineError::EmailNotFound(_) => ApiError::NotFound("email not found"),
            EngineError::FollowUpNotFound(_) => ApiError::NotFound("follow-up not found"),
            EngineError::ThreadNotFound(_) => ApiError::NotFound("original email not found"),
            EngineError::NotPending(_) => {
                ApiError::BadRequest("follow-up is not pending".to_string())
            }
            EngineError::EmptyContent(_) => {
                ApiError::BadRequest("follow-up has no drafted content".to_string())
            }
            other => {
                error!("{context}: {other}");
                ApiError::Internal
            }
        }
    }
}

/// Run a blocking store/adapter closure off the async runtime.
pub(super) async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(err) => {
            error!("blocking task failed: {err}");
            Err(ApiError::Internal)
        }
    }
}
