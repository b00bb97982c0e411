#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_pipeline::orchestrator::Orchestrator;
use framesmith_pipeline::runner::StageRunner;
use framesmith_worker::app::build_app;
use framesmith_worker::config::WorkerConfig;
use framesmith_worker::state::AppState;

/// Serve a stub inference server that only answers its health probe.
pub async fn spawn_healthy_comfy() -> String {
    let router = Router::new().route("/system_stats", get(|| async { "{}" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn test_config(comfyui_url: &str, root: &std::path::Path) -> WorkerConfig {
    let env: HashMap<&str, String> = HashMap::from([
        ("COMFYUI_URL", comfyui_url.to_string()),
        ("COMFYUI_PATH", root.join("comfy").display().to_string()),
        ("WORK_DIR", root.join("work").display().to_string()),
        ("WORKFLOW_TEMPLATE", root.join("template.json").display().to_string()),
        ("POLL_INTERVAL_SECS", "1".to_string()),
        ("COMPLETION_TIMEOUT_SECS", "2".to_string()),
    ]);
    WorkerConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
}

/// Build the full application router in attach mode.
pub fn build_test_app(config: &WorkerConfig) -> Router {
    let api = ComfyUIApi::new(config.comfyui_url.clone());
    let runner = StageRunner::new(config.pipeline(), api.clone(), Arc::new(config.toolkit()));
    let orchestrator = Arc::new(Orchestrator::new(None, api, runner));
    build_app(AppState { orchestrator }, config.max_body_bytes)
}

pub async fn get_req(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_raw(app: Router, uri: &str, body: impl Into<Body>) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
