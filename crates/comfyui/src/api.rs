//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, history queries, the liveness probe,
//! artifact download, and queue cancellation using [`reqwest`].

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::completion::StatusSource;
use crate::history::{parse_prompt_status, OutputFile, PromptStatus};
use crate::workflow::Workflow;

/// Default liveness endpoint.
pub const DEFAULT_HEALTH_PATH: &str = "/system_stats";

/// Per-request timeout for a single liveness probe.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request timeout for status and control calls.
const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    health_path: String,
}

/// Correlates a submitted workflow with the server's tracking id and the
/// session id used for push notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// Server-assigned tracking identifier.
    pub prompt_id: String,
    /// Session identifier the workflow was submitted under.
    pub client_id: String,
    /// Position in the execution queue, when reported.
    pub queue_number: Option<i64>,
}

/// Raw `/prompt` response. ComfyUI answers 200 with `prompt_id` on
/// success and an `error` object (usually with 400) on validation failure.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: Option<String>,
    number: Option<i64>,
    error: Option<serde_json::Value>,
    #[serde(default)]
    node_errors: serde_json::Value,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The server refused the workflow or answered without a tracking id.
    #[error("submission rejected: {reason}")]
    Rejected { reason: String },

    /// Writing a downloaded artifact to disk failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }

    /// Override the liveness endpoint (must start with `/`).
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// HTTP base URL this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the bound workflow and `client_id`. A
    /// non-2xx answer, an `error` payload, or a body without `prompt_id`
    /// is reported as [`ComfyUIApiError::Rejected`].
    pub async fn submit_workflow(
        &self,
        workflow: &Workflow,
        client_id: &str,
    ) -> Result<SubmissionReceipt, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(CONTROL_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ComfyUIApiError::Rejected {
                reason: format!("HTTP {}: {}", status.as_u16(), text.trim()),
            });
        }

        let parsed: SubmitResponse =
            serde_json::from_str(&text).map_err(|e| ComfyUIApiError::Rejected {
                reason: format!("malformed response ({e}): {}", text.trim()),
            })?;

        if let Some(error) = parsed.error {
            return Err(ComfyUIApiError::Rejected {
                reason: format!("{error} (node errors: {})", parsed.node_errors),
            });
        }

        let prompt_id = parsed
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ComfyUIApiError::Rejected {
                reason: format!("response lacks prompt_id: {}", text.trim()),
            })?;

        Ok(SubmissionReceipt {
            prompt_id,
            client_id: client_id.to_string(),
            queue_number: parsed.number,
        })
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The body is `{}` until
    /// the prompt has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(CONTROL_REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Single liveness probe against the health endpoint.
    pub async fn probe_health(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}{}", self.api_url, self.health_path))
            .timeout(PROBE_REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Stream an output artifact (`GET /view`) into `dest`.
    pub async fn download_artifact(
        &self,
        file: &OutputFile,
        dest: &Path,
    ) -> Result<u64, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_str()),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }

    /// Remove a prompt from the queue (`POST /queue`).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .timeout(CONTROL_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .timeout(CONTROL_REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusSource for ComfyUIApi {
    async fn query_status(&self, prompt_id: &str) -> Result<PromptStatus, ComfyUIApiError> {
        let history = self.get_history(prompt_id).await?;
        Ok(parse_prompt_status(&history, prompt_id))
    }
}
