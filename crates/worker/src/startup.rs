//! Bringing the inference server up before the first job.

use std::sync::Arc;

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_comfyui::supervisor::{
    await_external_ready, ReadinessConfig, ServerHandle, SupervisorConfig, SupervisorError,
};

/// Launch and wait for the inference server, or only wait for it in
/// attach mode (`supervisor == None`).
///
/// A launched process that never becomes ready is killed when its handle
/// is dropped on the error path.
pub async fn start_inference_server(
    supervisor: Option<&SupervisorConfig>,
    api: &ComfyUIApi,
    readiness: &ReadinessConfig,
) -> Result<Option<Arc<ServerHandle>>, SupervisorError> {
    tracing::info!(
        url = api.api_url(),
        timeout_secs = readiness.timeout.as_secs(),
        attach = supervisor.is_none(),
        "Waiting for inference server"
    );

    match supervisor {
        Some(config) => {
            let handle = ServerHandle::start(config)?.await_ready(api, readiness).await?;
            Ok(Some(Arc::new(handle)))
        }
        None => {
            await_external_ready(api, readiness).await?;
            Ok(None)
        }
    }
}
