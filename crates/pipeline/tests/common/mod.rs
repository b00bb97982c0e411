#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_comfyui::completion::{CompletionOptions, CompletionStrategy};
use framesmith_core::workspace::WorkspaceLayout;
use framesmith_pipeline::config::{PipelineConfig, DEFAULT_OUTPUT_PATTERN};
use framesmith_pipeline::media::{count_files, DemuxOutput, MediaError, MediaToolkit};
use framesmith_pipeline::runner::StageRunner;

pub const PROMPT_ID: &str = "prompt-1";

/// How the stub inference server behaves once a workflow is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Writes `n` result frames into the shared output dir.
    WritesFrames(usize),
    /// Reports completion but writes nothing and lists only a preview.
    WritesNothing,
    /// Lists `n` result frames in history, served only over `/view`.
    RemoteOnly(usize),
    /// Answers `/prompt` without a prompt id.
    RejectsSubmission,
    /// Reports an execution error in history.
    FailsExecution,
    /// History stays empty forever.
    NeverFinishes,
}

#[derive(Clone)]
pub struct StubComfy {
    behavior: Behavior,
    output_dir: PathBuf,
    pub submissions: Arc<Mutex<Vec<Value>>>,
    pub history_queries: Arc<AtomicUsize>,
    pub interrupts: Arc<AtomicUsize>,
}

impl StubComfy {
    pub fn submitted(&self) -> Vec<Value> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn history_count(&self) -> usize {
        self.history_queries.load(Ordering::SeqCst)
    }
}

fn frame_name(i: usize) -> String {
    format!("ResultFrames_{i:05}_.png")
}

async fn submit(State(stub): State<StubComfy>, Json(body): Json<Value>) -> Json<Value> {
    stub.submissions.lock().unwrap().push(body);

    match stub.behavior {
        Behavior::RejectsSubmission => return Json(json!({"number": 3, "node_errors": {}})),
        Behavior::WritesFrames(n) => {
            for i in 1..=n {
                std::fs::write(stub.output_dir.join(frame_name(i)), format!("frame-{i}")).unwrap();
            }
        }
        _ => {}
    }
    Json(json!({"prompt_id": PROMPT_ID, "number": 0, "node_errors": {}}))
}

async fn history(State(stub): State<StubComfy>, UrlPath(id): UrlPath<String>) -> Json<Value> {
    stub.history_queries.fetch_add(1, Ordering::SeqCst);

    let images: Vec<Value> = match stub.behavior {
        Behavior::NeverFinishes => return Json(json!({})),
        Behavior::FailsExecution => {
            return Json(json!({
                id: {
                    "outputs": {},
                    "status": {
                        "status_str": "error",
                        "completed": false,
                        "messages": [
                            ["execution_start", {"prompt_id": PROMPT_ID}],
                            ["execution_error", {"prompt_id": PROMPT_ID, "exception_message": "CUDA out of memory"}]
                        ]
                    }
                }
            }))
        }
        Behavior::WritesFrames(n) | Behavior::RemoteOnly(n) => (1..=n)
            .map(|i| json!({"filename": frame_name(i), "subfolder": "", "type": "output"}))
            .collect(),
        Behavior::WritesNothing => {
            vec![json!({"filename": "Preview_00001_.png", "subfolder": "", "type": "temp"})]
        }
        Behavior::RejectsSubmission => Vec::new(),
    };

    Json(json!({
        id: {
            "outputs": {"20": {"images": images}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

async fn view(
    State(stub): State<StubComfy>,
    axum::extract::Query(q): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> Result<Vec<u8>, axum::http::StatusCode> {
    match (stub.behavior, q.get("filename")) {
        (Behavior::RemoteOnly(_), Some(name)) => Ok(format!("remote-{name}").into_bytes()),
        _ => Err(axum::http::StatusCode::NOT_FOUND),
    }
}

async fn interrupt(State(stub): State<StubComfy>) -> axum::http::StatusCode {
    stub.interrupts.fetch_add(1, Ordering::SeqCst);
    axum::http::StatusCode::OK
}

/// Start a stub ComfyUI on an ephemeral port. Returns its base URL.
pub async fn spawn_comfy(behavior: Behavior, output_dir: &Path) -> (String, StubComfy) {
    let stub = StubComfy {
        behavior,
        output_dir: output_dir.to_path_buf(),
        submissions: Arc::default(),
        history_queries: Arc::default(),
        interrupts: Arc::default(),
    };

    let router = Router::new()
        .route("/prompt", post(submit))
        .route("/history/{id}", get(history))
        .route("/view", get(view))
        .route("/queue", post(|| async { axum::http::StatusCode::OK }))
        .route("/interrupt", post(interrupt))
        .route("/system_stats", get(|| async { Json(json!({"system": {}})) }))
        .with_state(stub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), stub)
}

/// Media toolkit double: demux writes `frames` PNGs, mux writes
/// `MUXED:<result frame count>` to the output path.
pub struct StubToolkit {
    pub frames: usize,
    pub fail_mux: bool,
}

#[async_trait]
impl MediaToolkit for StubToolkit {
    async fn demux(
        &self,
        video: &Path,
        frames_dir: &Path,
        _scratch_dir: &Path,
    ) -> Result<DemuxOutput, MediaError> {
        assert!(video.exists(), "demux called before the video was staged");
        for i in 1..=self.frames {
            tokio::fs::write(frames_dir.join(format!("frame_{i:05}.png")), b"png").await?;
        }
        Ok(DemuxOutput {
            frames_dir: frames_dir.to_path_buf(),
            frame_count: self.frames,
            framerate: Some("24/1".to_string()),
            audio: None,
        })
    }

    async fn mux(
        &self,
        frame_pattern: &Path,
        _source: &DemuxOutput,
        output: &Path,
    ) -> Result<(), MediaError> {
        if self.fail_mux {
            return Err(MediaError::MissingOutput("encoder crashed".into()));
        }
        let dir = frame_pattern.parent().unwrap();
        let count = count_files(dir).await?;
        tokio::fs::write(output, format!("MUXED:{count}")).await?;
        Ok(())
    }
}

/// Scratch directories and template for one test.
pub struct Fixture {
    pub root: tempfile::TempDir,
    pub layout: WorkspaceLayout,
    pub template_path: PathBuf,
    pub staged_dir: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout {
            input_dir: root.path().join("comfy/input"),
            output_dir: root.path().join("comfy/output"),
            temp_dir: root.path().join("work"),
        };
        for dir in layout.dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }

        let staged_dir = root.path().join("staged");
        std::fs::create_dir_all(&staged_dir).unwrap();
        std::fs::write(staged_dir.join("clip.mp4"), b"source-video").unwrap();

        let template_path = root.path().join("template.json");
        std::fs::write(&template_path, template_json().to_string()).unwrap();

        Self {
            root,
            layout,
            template_path,
            staged_dir,
        }
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            workspace: self.layout.clone(),
            template_path: self.template_path.clone(),
            staged_input_root: Some(self.staged_dir.clone()),
            download_timeout: Duration::from_secs(5),
            artifact_timeout: Duration::from_secs(5),
            completion: CompletionOptions {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
                strategy: CompletionStrategy::Poll,
            },
            output_pattern: Regex::new(DEFAULT_OUTPUT_PATTERN).unwrap(),
        }
    }

    pub fn runner(&self, url: &str, toolkit: StubToolkit) -> StageRunner {
        self.runner_with(self.config(), url, toolkit)
    }

    pub fn runner_with(&self, config: PipelineConfig, url: &str, toolkit: StubToolkit) -> StageRunner {
        StageRunner::new(config, ComfyUIApi::new(url), Arc::new(toolkit))
    }

    pub fn entry_count(&self) -> usize {
        self.layout
            .dirs()
            .iter()
            .map(|d| std::fs::read_dir(d).map(|r| r.count()).unwrap_or(0))
            .sum()
    }
}

pub fn template_json() -> Value {
    json!({
        "slots": {
            "instruction": {"node": "6", "input": "text"},
            "reference_image": {"node": "10", "input": "image"},
            "frame_source": {"node": "12", "input": "directory"}
        },
        "workflow": {
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
            "10": {"class_type": "LoadImage", "inputs": {"image": ""}},
            "12": {"class_type": "VHS_LoadImagesPath", "inputs": {"directory": ""}},
            "20": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ResultFrames"}}
        }
    })
}
