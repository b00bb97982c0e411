use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_pipeline::orchestrator::Orchestrator;
use framesmith_pipeline::runner::StageRunner;
use framesmith_worker::app::build_app;
use framesmith_worker::config::WorkerConfig;
use framesmith_worker::startup::start_inference_server;
use framesmith_worker::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "framesmith_worker=info,framesmith_pipeline=info,framesmith_comfyui=info,comfyui_server=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().expect("Invalid worker configuration");
    tracing::info!(
        host = %config.host,
        port = config.port,
        comfyui_url = %config.comfyui_url,
        completion = ?config.completion_mode,
        "Loaded worker configuration"
    );

    // --- Inference server ---
    let api = ComfyUIApi::new(config.comfyui_url.clone()).with_health_path(config.health_path.clone());
    let supervisor = config.supervisor();
    let server = match start_inference_server(supervisor.as_ref(), &api, &config.readiness()).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Inference server unavailable, aborting startup");
            return ExitCode::FAILURE;
        }
    };

    // --- Orchestrator ---
    let runner = StageRunner::new(config.pipeline(), api.clone(), Arc::new(config.toolkit()));
    let orchestrator = Arc::new(Orchestrator::new(server.clone(), api, runner));
    let fatal = orchestrator.fatal_token();

    let app = build_app(AppState { orchestrator }, config.max_body_bytes);

    // --- Start server ---
    let addr = SocketAddr::new(config.host.parse().expect("Invalid HOST address"), config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone()))
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    if let Some(server) = server {
        server.shutdown().await;
        tracing::info!("Inference server stopped");
    }

    if fatal.is_cancelled() {
        tracing::error!("Exiting after losing the inference server");
        ExitCode::FAILURE
    } else {
        tracing::info!("Graceful shutdown complete");
        ExitCode::SUCCESS
    }
}

/// Wait for Ctrl-C, SIGTERM, or the orchestrator reporting a dead
/// inference server.
async fn shutdown_signal(fatal: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
        _ = fatal.cancelled() => tracing::warn!("Fatal orchestrator error, shutting down"),
    }
}
