//! Job request/response model.

use std::fmt;

use serde::{Deserialize, Serialize};

use framesmith_core::error::CoreError;
use framesmith_core::types::{new_job_id, JobId, Timestamp};

/// Where one input's bytes come from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputDescriptor {
    /// Remote `http(s)` URL, downloaded with a streamed write.
    Url(String),
    /// Inline base64 payload, optionally as a `data:` URI.
    Base64(String),
    /// File name relative to the pre-staged input directory.
    Path(String),
}

impl InputDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            InputDescriptor::Url(_) => "url",
            InputDescriptor::Base64(_) => "base64",
            InputDescriptor::Path(_) => "path",
        }
    }
}

// Inline payloads can be hundreds of megabytes; never print them.
impl fmt::Debug for InputDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputDescriptor::Url(url) => f.debug_tuple("Url").field(url).finish(),
            InputDescriptor::Base64(data) => write!(f, "Base64(<{} chars>)", data.len()),
            InputDescriptor::Path(path) => f.debug_tuple("Path").field(path).finish(),
        }
    }
}

/// The caller's job description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub video: InputDescriptor,
    pub reference_image: InputDescriptor,
    #[serde(alias = "prompt")]
    pub instruction: String,
}

/// A validated request with its identity.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub received_at: Timestamp,
    pub request: JobRequest,
}

impl Job {
    /// Validate `request` and assign a fresh id.
    pub fn new(request: JobRequest) -> Result<Self, CoreError> {
        if request.instruction.trim().is_empty() {
            return Err(CoreError::Validation(
                "instruction must not be empty".to_string(),
            ));
        }

        Ok(Self {
            id: new_job_id(),
            received_at: chrono::Utc::now(),
            request,
        })
    }
}

/// Terminal answer for a job. Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    /// Base64-encoded MP4.
    Result { result: String },
    Error { error: String },
}
