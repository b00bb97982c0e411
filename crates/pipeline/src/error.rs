//! Stage-scoped job errors.

use std::fmt;
use std::time::Duration;

use framesmith_comfyui::supervisor::SupervisorError;
use framesmith_comfyui::workflow::TemplateError;
use framesmith_core::error::CoreError;
use framesmith_core::workspace::WorkspaceError;

use crate::media::MediaError;

/// The pipeline stage a failure is attributed to.
///
/// The completion wait has two tags, `Timeout` and `Execution`, and a
/// completed prompt without matching results is `MissingOutput` rather
/// than `Postprocess`, so callers can tell them apart without parsing
/// the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Startup,
    Staging,
    Preprocess,
    Submit,
    Timeout,
    Execution,
    MissingOutput,
    Postprocess,
    Packaging,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Startup => "startup",
            Stage::Staging => "staging",
            Stage::Preprocess => "preprocess",
            Stage::Submit => "submit",
            Stage::Timeout => "timeout",
            Stage::Execution => "execution",
            Stage::MissingOutput => "missing_output",
            Stage::Postprocess => "postprocess",
            Stage::Packaging => "packaging",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a job can fail. Each variant belongs to exactly one [`Stage`].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The inference server is gone. Fatal to the worker, not just the job.
    #[error("inference server unavailable: {0}")]
    ServerUnavailable(#[from] SupervisorError),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] CoreError),

    #[error("workspace could not be prepared: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("failed to resolve input '{input}': {reason}")]
    InputResolution { input: &'static str, reason: String },

    #[error("media pre-processing failed: {0}")]
    Preprocess(#[source] MediaError),

    #[error("malformed workflow template: {0}")]
    MalformedTemplate(#[from] TemplateError),

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("prompt {prompt_id} did not complete within {}s", .elapsed.as_secs())]
    CompletionTimeout { prompt_id: String, elapsed: Duration },

    #[error("prompt {prompt_id} failed on the inference server: {message}")]
    Execution { prompt_id: String, message: String },

    #[error("no result frames: {0}")]
    MissingOutput(String),

    #[error("media post-processing failed: {0}")]
    Postprocess(#[source] MediaError),

    #[error("failed to package result: {0}")]
    Packaging(String),
}

impl JobError {
    pub fn stage(&self) -> Stage {
        match self {
            JobError::ServerUnavailable(_) => Stage::Startup,
            JobError::InvalidRequest(_)
            | JobError::Workspace(_)
            | JobError::InputResolution { .. } => Stage::Staging,
            JobError::Preprocess(_) => Stage::Preprocess,
            JobError::MalformedTemplate(_) | JobError::SubmissionRejected(_) => Stage::Submit,
            JobError::CompletionTimeout { .. } => Stage::Timeout,
            JobError::Execution { .. } => Stage::Execution,
            JobError::MissingOutput(_) => Stage::MissingOutput,
            JobError::Postprocess(_) => Stage::Postprocess,
            JobError::Packaging(_) => Stage::Packaging,
        }
    }

    /// Whether the worker must stop after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::ServerUnavailable(_))
    }

    /// Caller-facing message: `"<stage>: <cause>"`.
    pub fn client_message(&self) -> String {
        format!("{}: {}", self.stage(), self)
    }

    pub(crate) fn input(input: &'static str, reason: impl Into<String>) -> Self {
        JobError::InputResolution {
            input,
            reason: reason.into(),
        }
    }
}
