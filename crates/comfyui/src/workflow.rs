//! Workflow templates and slot binding.
//!
//! A template document pairs a ComfyUI API-format workflow with the
//! (node, input) locations of its bindable slots:
//!
//! ```json
//! {
//!   "slots": {
//!     "instruction":     {"node": "6",  "input": "text"},
//!     "reference_image": {"node": "10", "input": "image"},
//!     "frame_source":    {"node": "12", "input": "directory"}
//!   },
//!   "workflow": {"6": {"class_type": "CLIPTextEncode", "inputs": {...}}, ...}
//! }
//! ```
//!
//! Templates are loaded fresh per job and never written back. Binding
//! produces a new [`Workflow`]; the template is left untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of slots the orchestrator binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotName {
    /// Free-text instruction for the model.
    Instruction,
    /// File name of the reference image inside the server's input dir.
    ReferenceImage,
    /// Directory holding the extracted frame sequence.
    FrameSource,
}

impl SlotName {
    pub const ALL: [SlotName; 3] = [
        SlotName::Instruction,
        SlotName::ReferenceImage,
        SlotName::FrameSource,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SlotName::Instruction => "instruction",
            SlotName::ReferenceImage => "reference_image",
            SlotName::FrameSource => "frame_source",
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a slot inside the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlotRef {
    pub node: String,
    pub input: String,
}

/// One node of an API-format workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Anything else the editor stored on the node (`_meta`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An API-format workflow: node id -> node, serialized as a flat map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    pub nodes: BTreeMap<String, WorkflowNode>,
}

impl Workflow {
    /// Current value of `node`.`input`, if present.
    pub fn input(&self, node: &str, input: &str) -> Option<&Value> {
        self.nodes.get(node).and_then(|n| n.inputs.get(input))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("template does not declare required slot '{0}'")]
    MissingSlot(SlotName),

    #[error("slot '{slot}' points at node '{node}', which is not in the workflow")]
    DanglingSlot { slot: SlotName, node: String },

    #[error("template workflow has no nodes")]
    EmptyWorkflow,
}

#[derive(Deserialize)]
struct TemplateDocument {
    slots: BTreeMap<SlotName, SlotRef>,
    workflow: Workflow,
}

/// A parsed template with every required slot resolved.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    workflow: Workflow,
    slots: BTreeMap<SlotName, SlotRef>,
}

impl WorkflowTemplate {
    /// Parse a template document.
    ///
    /// Fails if any of [`SlotName::ALL`] is undeclared or points at a node
    /// that does not exist. Unknown slot names in the document are a
    /// parse error.
    pub fn load(source: &str) -> Result<Self, TemplateError> {
        let doc: TemplateDocument = serde_json::from_str(source)?;

        if doc.workflow.nodes.is_empty() {
            return Err(TemplateError::EmptyWorkflow);
        }

        for slot in SlotName::ALL {
            let slot_ref = doc.slots.get(&slot).ok_or(TemplateError::MissingSlot(slot))?;
            if !doc.workflow.nodes.contains_key(&slot_ref.node) {
                return Err(TemplateError::DanglingSlot {
                    slot,
                    node: slot_ref.node.clone(),
                });
            }
        }

        Ok(Self {
            workflow: doc.workflow,
            slots: doc.slots,
        })
    }

    /// Read and parse a template file.
    pub async fn load_file(path: &Path) -> Result<Self, TemplateError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::load(&source)
    }

    /// The unbound workflow as loaded.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Return a copy of the workflow with each slot overwritten.
    ///
    /// Bindings are applied in order, so binding a slot twice keeps the
    /// last value. Values are not validated.
    pub fn bind<I>(&self, bindings: I) -> Workflow
    where
        I: IntoIterator<Item = (SlotName, Value)>,
    {
        let mut workflow = self.workflow.clone();

        for (slot, value) in bindings {
            // `load` guarantees every slot resolves to an existing node.
            let Some(slot_ref) = self.slots.get(&slot) else {
                continue;
            };
            if let Some(node) = workflow.nodes.get_mut(&slot_ref.node) {
                node.inputs.insert(slot_ref.input.clone(), value);
            }
        }

        workflow
    }
}
