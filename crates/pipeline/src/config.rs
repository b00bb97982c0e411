use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use framesmith_comfyui::completion::CompletionOptions;
use framesmith_core::workspace::WorkspaceLayout;

/// Default naming convention for result frames written by the template's
/// save node (`ResultFrames_00001_.png`).
pub const DEFAULT_OUTPUT_PATTERN: &str = r"^ResultFrames_\d+_?\.png$";

/// Everything the stage runner needs, resolved by the binary at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace: WorkspaceLayout,
    /// Template document, re-read for every job.
    pub template_path: PathBuf,
    /// Root for `{"path": ...}` inputs. `None` disables pre-staged inputs.
    pub staged_input_root: Option<PathBuf>,
    /// Upper bound for a single remote input download.
    pub download_timeout: Duration,
    /// Upper bound for fetching all result frames over `/view`.
    pub artifact_timeout: Duration,
    pub completion: CompletionOptions,
    /// File names of result frames must match this.
    pub output_pattern: Regex,
}
