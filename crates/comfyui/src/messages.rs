//! ComfyUI push-channel frames.
//!
//! ComfyUI sends JSON text frames over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. Only the kinds that matter for
//! tracking a prompt are decoded; everything else is kept as
//! [`PushFrame::Other`] so newer server versions never break parsing.

use serde::Deserialize;
use serde_json::Value;

/// A decoded push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// Queue depth broadcast.
    Status { queue_remaining: Option<i64> },
    /// A prompt has started executing.
    ExecutionStart { prompt_id: String },
    /// A node is executing; `node == None` means the prompt finished.
    Executing {
        node: Option<String>,
        prompt_id: Option<String>,
    },
    /// Step-level progress within a node.
    Progress { value: i64, max: i64 },
    /// Sent by newer servers once a prompt finished successfully.
    ExecutionSuccess { prompt_id: String },
    /// The prompt failed inside a node.
    ExecutionError {
        prompt_id: String,
        node_id: Option<String>,
        exception_type: Option<String>,
        exception_message: String,
    },
    /// The prompt was interrupted.
    ExecutionInterrupted { prompt_id: String },
    /// Any other frame kind.
    Other(String),
}

/// What a frame means for one tracked prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Finished,
    Failed(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PromptData {
    prompt_id: String,
}

#[derive(Deserialize)]
struct ExecutingData {
    node: Option<String>,
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ProgressData {
    value: i64,
    max: i64,
}

#[derive(Deserialize)]
struct ErrorData {
    prompt_id: String,
    node_id: Option<String>,
    exception_type: Option<String>,
    #[serde(default)]
    exception_message: String,
}

/// Parse a text frame.
///
/// Returns `Err` for malformed JSON, or when a known frame kind carries
/// a payload of the wrong shape.
pub fn parse_frame(text: &str) -> Result<PushFrame, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;

    let frame = match raw.kind.as_str() {
        "status" => PushFrame::Status {
            queue_remaining: raw
                .data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(Value::as_i64),
        },
        "execution_start" => {
            let d: PromptData = serde_json::from_value(raw.data)?;
            PushFrame::ExecutionStart {
                prompt_id: d.prompt_id,
            }
        }
        "executing" => {
            let d: ExecutingData = serde_json::from_value(raw.data)?;
            PushFrame::Executing {
                node: d.node,
                prompt_id: d.prompt_id,
            }
        }
        "progress" => {
            let d: ProgressData = serde_json::from_value(raw.data)?;
            PushFrame::Progress {
                value: d.value,
                max: d.max,
            }
        }
        "execution_success" => {
            let d: PromptData = serde_json::from_value(raw.data)?;
            PushFrame::ExecutionSuccess {
                prompt_id: d.prompt_id,
            }
        }
        "execution_error" => {
            let d: ErrorData = serde_json::from_value(raw.data)?;
            PushFrame::ExecutionError {
                prompt_id: d.prompt_id,
                node_id: d.node_id,
                exception_type: d.exception_type,
                exception_message: d.exception_message,
            }
        }
        "execution_interrupted" => {
            let d: PromptData = serde_json::from_value(raw.data)?;
            PushFrame::ExecutionInterrupted {
                prompt_id: d.prompt_id,
            }
        }
        _ => PushFrame::Other(raw.kind),
    };

    Ok(frame)
}

impl PushFrame {
    /// Whether this frame ends tracking of `prompt_id`, and how.
    pub fn outcome_for(&self, prompt_id: &str) -> Option<FrameOutcome> {
        match self {
            PushFrame::Executing {
                node: None,
                prompt_id: Some(id),
            }
            | PushFrame::ExecutionSuccess { prompt_id: id }
                if id == prompt_id =>
            {
                Some(FrameOutcome::Finished)
            }
            PushFrame::ExecutionError {
                prompt_id: id,
                node_id,
                exception_type,
                exception_message,
            } if id == prompt_id => Some(FrameOutcome::Failed(format!(
                "node {} raised {}: {}",
                node_id.as_deref().unwrap_or("?"),
                exception_type.as_deref().unwrap_or("error"),
                exception_message.trim(),
            ))),
            PushFrame::ExecutionInterrupted { prompt_id: id } if id == prompt_id => {
                Some(FrameOutcome::Failed("execution interrupted".to_string()))
            }
            _ => None,
        }
    }
}
