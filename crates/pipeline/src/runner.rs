//! Drives one job through every pipeline stage.
//!
//! Stages run strictly in order and are never retried. The workspace is
//! leased for the whole run, so every exit path, including early
//! returns through `?`, leaves the job directories empty.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;

use framesmith_comfyui::api::{ComfyUIApi, ComfyUIApiError, SubmissionReceipt};
use framesmith_comfyui::completion::{await_completion, CompletionError};
use framesmith_comfyui::history::OutputManifest;
use framesmith_comfyui::workflow::{SlotName, WorkflowTemplate};
use framesmith_core::workspace::{WorkspaceLayout, WorkspaceManager};

use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::job::Job;
use crate::media::{count_files, DemuxOutput, MediaError, MediaToolkit};
use crate::outputs::{collect_result_frames, RESULT_FRAME_PATTERN};
use crate::staging::InputStager;
use crate::state::{PipelineState, StateTracker};

/// File name the template's image loader reads from the input directory.
pub const REFERENCE_IMAGE_NAME: &str = "face_reference.png";
/// Frame sequence directory inside the input directory.
pub const FRAMES_DIR_NAME: &str = "video_frames";

const STAGED_VIDEO_NAME: &str = "base_video.mp4";
const RESULT_FRAMES_DIR_NAME: &str = "result_frames";
const FINAL_VIDEO_NAME: &str = "final_output.mp4";

/// Fixed locations inside the workspace for one job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub video: PathBuf,
    pub reference_image: PathBuf,
    pub frames_dir: PathBuf,
    pub result_frames_dir: PathBuf,
    pub final_video: PathBuf,
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl JobPaths {
    pub fn new(layout: &WorkspaceLayout) -> Self {
        Self {
            video: layout.temp_dir.join(STAGED_VIDEO_NAME),
            reference_image: layout.input_dir.join(REFERENCE_IMAGE_NAME),
            frames_dir: layout.input_dir.join(FRAMES_DIR_NAME),
            result_frames_dir: layout.temp_dir.join(RESULT_FRAMES_DIR_NAME),
            final_video: layout.temp_dir.join(FINAL_VIDEO_NAME),
            scratch_dir: layout.temp_dir.clone(),
            output_dir: layout.output_dir.clone(),
        }
    }
}

pub struct StageRunner {
    config: PipelineConfig,
    api: ComfyUIApi,
    toolkit: Arc<dyn MediaToolkit>,
    stager: InputStager,
    workspace: WorkspaceManager,
}

impl StageRunner {
    pub fn new(config: PipelineConfig, api: ComfyUIApi, toolkit: Arc<dyn MediaToolkit>) -> Self {
        let stager = InputStager::new(config.download_timeout, config.staged_input_root.clone());
        let workspace = WorkspaceManager::new(config.workspace.clone());
        Self {
            config,
            api,
            toolkit,
            stager,
            workspace,
        }
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    /// Run `job` to completion and return the base64-encoded result.
    ///
    /// `client_id` is the session the workflow is submitted under.
    pub async fn run(&self, job: &Job, client_id: &str) -> Result<String, JobError> {
        let lease = self.workspace.lease()?;
        let paths = JobPaths::new(lease.layout());
        let mut tracker = StateTracker::new(job.id);

        let result = self.drive(job, client_id, &paths, &mut tracker).await;

        if let Err(e) = &result {
            advance(&mut tracker, PipelineState::Failed(e.stage()));
        }
        drop(lease);
        result
    }

    async fn drive(
        &self,
        job: &Job,
        client_id: &str,
        paths: &JobPaths,
        tracker: &mut StateTracker,
    ) -> Result<String, JobError> {
        self.stage_inputs(job, paths).await?;
        advance(tracker, PipelineState::InputsStaged);

        let demuxed = self.preprocess(paths).await?;
        advance(tracker, PipelineState::PreProcessed);

        let receipt = self.submit(job, client_id, paths).await?;
        advance(tracker, PipelineState::Submitted);

        let manifest = self.wait(&receipt).await?;
        advance(tracker, PipelineState::Completed);

        self.postprocess(&manifest, &demuxed, paths).await?;
        advance(tracker, PipelineState::PostProcessed);

        let encoded = package(&paths.final_video).await?;
        advance(tracker, PipelineState::Packaged);

        advance(tracker, PipelineState::Done);
        Ok(encoded)
    }

    async fn stage_inputs(&self, job: &Job, paths: &JobPaths) -> Result<(), JobError> {
        self.stager
            .stage("video", &job.request.video, &paths.video)
            .await?;
        self.stager
            .stage("reference_image", &job.request.reference_image, &paths.reference_image)
            .await?;
        Ok(())
    }

    async fn preprocess(&self, paths: &JobPaths) -> Result<DemuxOutput, JobError> {
        tokio::fs::create_dir_all(&paths.frames_dir)
            .await
            .map_err(|e| JobError::Preprocess(e.into()))?;

        let demuxed = self
            .toolkit
            .demux(&paths.video, &paths.frames_dir, &paths.scratch_dir)
            .await
            .map_err(JobError::Preprocess)?;

        let frames = count_files(&paths.frames_dir)
            .await
            .map_err(|e| JobError::Preprocess(e.into()))?;
        if frames == 0 {
            return Err(JobError::Preprocess(MediaError::MissingOutput(format!(
                "no frames extracted into {}",
                paths.frames_dir.display()
            ))));
        }
        Ok(demuxed)
    }

    async fn submit(
        &self,
        job: &Job,
        client_id: &str,
        paths: &JobPaths,
    ) -> Result<SubmissionReceipt, JobError> {
        let template = WorkflowTemplate::load_file(&self.config.template_path).await?;

        let workflow = template.bind([
            (
                SlotName::Instruction,
                Value::String(job.request.instruction.clone()),
            ),
            (
                SlotName::ReferenceImage,
                Value::String(REFERENCE_IMAGE_NAME.to_string()),
            ),
            (
                SlotName::FrameSource,
                Value::String(paths.frames_dir.to_string_lossy().into_owned()),
            ),
        ]);

        let receipt = self
            .api
            .submit_workflow(&workflow, client_id)
            .await
            .map_err(|e| match e {
                ComfyUIApiError::Rejected { reason } => JobError::SubmissionRejected(reason),
                other => JobError::SubmissionRejected(other.to_string()),
            })?;

        tracing::info!(
            job_id = %job.id,
            prompt_id = %receipt.prompt_id,
            queue_number = ?receipt.queue_number,
            "Workflow submitted"
        );
        Ok(receipt)
    }

    async fn wait(&self, receipt: &SubmissionReceipt) -> Result<OutputManifest, JobError> {
        match await_completion(&self.api, receipt, &self.config.completion).await {
            Ok(manifest) => Ok(manifest),
            Err(CompletionError::Timeout { prompt_id, elapsed }) => {
                self.abandon(&prompt_id).await;
                Err(JobError::CompletionTimeout { prompt_id, elapsed })
            }
            Err(CompletionError::ExecutionFailed { prompt_id, message }) => {
                Err(JobError::Execution { prompt_id, message })
            }
        }
    }

    /// Best-effort removal of a prompt we stopped waiting for, so it does
    /// not keep the GPU busy for the next job.
    async fn abandon(&self, prompt_id: &str) {
        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            tracing::warn!(prompt_id, error = %e, "Failed to dequeue timed-out prompt");
        }
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(prompt_id, error = %e, "Failed to interrupt timed-out prompt");
        }
    }

    async fn postprocess(
        &self,
        manifest: &OutputManifest,
        demuxed: &DemuxOutput,
        paths: &JobPaths,
    ) -> Result<(), JobError> {
        let frames = collect_result_frames(
            &self.api,
            &paths.output_dir,
            manifest,
            &self.config.output_pattern,
            &paths.result_frames_dir,
            self.config.artifact_timeout,
        )
        .await?;

        if frames != demuxed.frame_count {
            tracing::warn!(
                result_frames = frames,
                source_frames = demuxed.frame_count,
                "Result frame count differs from source"
            );
        }

        self.toolkit
            .mux(
                &paths.result_frames_dir.join(RESULT_FRAME_PATTERN),
                demuxed,
                &paths.final_video,
            )
            .await
            .map_err(JobError::Postprocess)?;

        match tokio::fs::metadata(&paths.final_video).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(JobError::Postprocess(MediaError::MissingOutput(format!(
                "{} was not written",
                paths.final_video.display()
            )))),
        }
    }
}

async fn package(final_video: &Path) -> Result<String, JobError> {
    let bytes = tokio::fs::read(final_video)
        .await
        .map_err(|e| JobError::Packaging(format!("{}: {e}", final_video.display())))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn advance(tracker: &mut StateTracker, next: PipelineState) {
    if let Err(e) = tracker.advance(next) {
        tracing::error!(error = %e, "Pipeline state out of sync");
    }
}
