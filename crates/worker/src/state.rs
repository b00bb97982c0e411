use std::sync::Arc;

use framesmith_pipeline::orchestrator::Orchestrator;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}
