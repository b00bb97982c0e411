use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors answered before a job is handed to the orchestrator.
///
/// Job failures are not errors at this layer: they are a normal
/// `200 {"error": ...}` response.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        tracing::warn!(%status, error = %message, "Rejected request");
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
