use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_comfyui::supervisor::{ServerHandle, ServerState, SupervisorError};

use crate::error::JobError;
use crate::job::{Job, JobRequest, JobResponse};
use crate::runner::StageRunner;

/// Owns everything that outlives a single job: the supervised server,
/// the session id, and the one-job-at-a-time gate.
///
/// Constructed once at startup and shared by reference with the HTTP
/// intake.
pub struct Orchestrator {
    /// `None` when attached to a server this process did not launch.
    server: Option<Arc<ServerHandle>>,
    api: ComfyUIApi,
    runner: StageRunner,
    client_id: String,
    gate: Arc<Mutex<()>>,
    fatal: CancellationToken,
}

impl Orchestrator {
    pub fn new(server: Option<Arc<ServerHandle>>, api: ComfyUIApi, runner: StageRunner) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%client_id, attached = server.is_none(), "Orchestrator ready");
        Self {
            server,
            api,
            runner,
            client_id,
            gate: Arc::new(Mutex::new(())),
            fatal: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Cancelled once the inference server is found dead.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Current inference server state.
    ///
    /// In attach mode there is no process to inspect, so the health
    /// endpoint is probed instead.
    pub async fn server_state(&self) -> ServerState {
        match &self.server {
            Some(server) => {
                // Refreshes the state if the process has exited.
                let _ = server.check_alive().await;
                server.state()
            }
            None => match self.api.probe_health().await {
                Ok(()) => ServerState::Ready,
                Err(_) => ServerState::Failed,
            },
        }
    }

    /// Run one job. Waits for any job already in progress.
    ///
    /// Once the gate is acquired the job runs on its own task, so it
    /// reaches a terminal state and releases the gate even if the
    /// caller stops waiting. The response carries exactly one of
    /// `result` or `error`.
    pub async fn handle(self: &Arc<Self>, request: JobRequest) -> JobResponse {
        let job = match Job::new(request) {
            Ok(job) => job,
            Err(e) => return self.report(None, JobError::from(e)),
        };

        let permit = Arc::clone(&self.gate).lock_owned().await;
        let this = Arc::clone(self);
        let span = tracing::info_span!("job", job_id = %job.id);

        let task = tokio::spawn(
            async move {
                let _permit = permit;
                this.execute(job).await
            }
            .instrument(span),
        );

        match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Job task aborted");
                JobResponse::Error {
                    error: format!("internal: job task failed: {e}"),
                }
            }
        }
    }

    async fn execute(&self, job: Job) -> JobResponse {
        tracing::info!(
            video = job.request.video.kind(),
            reference_image = job.request.reference_image.kind(),
            "Job received"
        );

        let outcome = match self.ensure_server_alive().await {
            Ok(()) => self.runner.run(&job, &self.client_id).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                let elapsed = chrono::Utc::now() - job.received_at;
                tracing::info!(
                    bytes = result.len(),
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Job finished"
                );
                JobResponse::Result { result }
            }
            Err(e) => self.report(Some(&job), e),
        }
    }

    /// Supervised servers are checked for process exit. Attached servers
    /// must answer their health endpoint.
    async fn ensure_server_alive(&self) -> Result<(), JobError> {
        match &self.server {
            Some(server) => server.check_alive().await?,
            None => self
                .api
                .probe_health()
                .await
                .map_err(|e| SupervisorError::Unreachable(e.to_string()))?,
        }
        Ok(())
    }

    fn report(&self, job: Option<&Job>, err: JobError) -> JobResponse {
        let job_id = job.map(|j| j.id.to_string());
        let elapsed_ms = job.map(|j| (chrono::Utc::now() - j.received_at).num_milliseconds());
        tracing::error!(
            job_id = job_id.as_deref().unwrap_or("-"),
            stage = %err.stage(),
            elapsed_ms,
            error = %err,
            "Job failed"
        );

        if err.is_fatal() {
            tracing::error!("Inference server lost, shutting down");
            self.fatal.cancel();
        }

        JobResponse::Error {
            error: err.client_message(),
        }
    }
}
