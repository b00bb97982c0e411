use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use framesmith_comfyui::supervisor::ServerState;
use framesmith_pipeline::job::{JobRequest, JobResponse};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` when the inference server is ready, `degraded` otherwise.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub inference_server: String,
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let server = state.orchestrator.server_state().await;
    let status = if server == ServerState::Ready {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        inference_server: server.to_string(),
    })
}

/// POST /run -- accepts `{"input": {...}}` or the bare job request.
async fn run_job(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<Json<JobResponse>> {
    let Json(body) = body.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let request = parse_job_request(body)?;

    Ok(Json(state.orchestrator.handle(request).await))
}

fn parse_job_request(mut body: Value) -> AppResult<JobRequest> {
    let payload = match body.get_mut("input") {
        Some(input) => input.take(),
        None => body,
    };
    serde_json::from_value(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid job request: {e}")))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/run", post(run_job))
}
