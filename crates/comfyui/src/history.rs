//! Interpretation of ComfyUI `/history/{prompt_id}` payloads.
//!
//! The history endpoint returns `{}` while a prompt is queued or running
//! and `{"<prompt_id>": {"outputs": {...}, "status": {...}}}` once it has
//! finished. [`parse_prompt_status`] folds that into a [`PromptStatus`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single file the server reported as a node output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Node that produced the file.
    pub node_id: String,
    pub filename: String,
    /// Sub-folder below the server's output root (often empty).
    pub subfolder: String,
    /// Folder kind: `output`, `temp` or `input`.
    pub kind: String,
}

/// Every output file declared for one finished prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputManifest {
    pub files: Vec<OutputFile>,
}

impl OutputManifest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Outcome of one status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptStatus {
    /// Not finished (queued, running, or unknown to the server yet).
    Pending,
    /// Finished; the manifest may be empty if the workflow saved nothing.
    Completed(OutputManifest),
    /// The server reports a failed execution.
    Failed { message: String },
}

#[derive(Debug, Default, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: serde_json::Map<String, Value>,
    #[serde(default)]
    status: Option<HistoryStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: Option<String>,
    #[serde(default)]
    completed: bool,
    /// `[["execution_start", {...}], ["execution_error", {...}], ...]`
    #[serde(default)]
    messages: Vec<(String, Value)>,
}

/// Fold a history payload into the status of `prompt_id`.
///
/// A missing entry is `Pending`. An entry whose status is `error` is
/// `Failed` with the server's exception message when present. An entry
/// with at least one node output, or one flagged `completed`, is
/// `Completed`.
pub fn parse_prompt_status(history: &Value, prompt_id: &str) -> PromptStatus {
    let Some(raw) = history.get(prompt_id) else {
        return PromptStatus::Pending;
    };

    let entry: HistoryEntry = match serde_json::from_value(raw.clone()) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(prompt_id, error = %e, "Unreadable history entry");
            return PromptStatus::Pending;
        }
    };
    let status = entry.status.unwrap_or_default();

    if status.status_str.as_deref() == Some("error") {
        return PromptStatus::Failed {
            message: execution_error_message(&status.messages)
                .unwrap_or_else(|| "execution failed".to_string()),
        };
    }

    if !entry.outputs.is_empty() || status.completed {
        return PromptStatus::Completed(collect_files(&entry.outputs));
    }

    PromptStatus::Pending
}

/// Pull `exception_message` out of the first `execution_error` message.
fn execution_error_message(messages: &[(String, Value)]) -> Option<String> {
    messages
        .iter()
        .find(|(kind, _)| kind == "execution_error")
        .and_then(|(_, data)| data.get("exception_message"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
}

/// Collect every `{filename, subfolder, type}` object from each node's
/// output lists (`images`, `gifs`, `videos`, ...), sorted by node then name.
fn collect_files(outputs: &serde_json::Map<String, Value>) -> OutputManifest {
    let mut files = Vec::new();

    for (node_id, node_output) in outputs {
        let Some(lists) = node_output.as_object() else {
            continue;
        };
        for items in lists.values().filter_map(Value::as_array) {
            for item in items {
                let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                files.push(OutputFile {
                    node_id: node_id.clone(),
                    filename: filename.to_string(),
                    subfolder: str_field(item, "subfolder"),
                    kind: str_field(item, "type"),
                });
            }
        }
    }

    files.sort_by(|a, b| {
        a.node_id
            .cmp(&b.node_id)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    OutputManifest { files }
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
