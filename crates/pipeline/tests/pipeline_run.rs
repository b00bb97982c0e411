//! End-to-end stage runs against a stub inference server and a stub
//! media toolkit.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use base64::Engine;

use common::{spawn_comfy, Behavior, Fixture, StubToolkit, PROMPT_ID};
use framesmith_comfyui::api::ComfyUIApi;
use framesmith_comfyui::supervisor::{ServerHandle, SupervisorConfig};
use framesmith_pipeline::error::{JobError, Stage};
use framesmith_pipeline::job::{InputDescriptor, Job, JobRequest, JobResponse};
use framesmith_pipeline::orchestrator::Orchestrator;

fn request() -> JobRequest {
    JobRequest {
        video: InputDescriptor::Path("clip.mp4".into()),
        // "face-bytes"
        reference_image: InputDescriptor::Base64("data:image/png;base64,ZmFjZS1ieXRlcw==".into()),
        instruction: "make it snow; rm -rf /".into(),
    }
}

fn toolkit(frames: usize) -> StubToolkit {
    StubToolkit {
        frames,
        fail_mux: false,
    }
}

fn decode(result: &str) -> String {
    let bytes = base64::engine::general_purpose::STANDARD.decode(result).unwrap();
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn successful_job_returns_muxed_video_and_cleans_up() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(3), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(3));

    let job = Job::new(request()).unwrap();
    let result = runner.run(&job, "session-a").await.unwrap();

    assert_eq!(decode(&result), "MUXED:3");
    assert_eq!(fx.entry_count(), 0, "workspace must be empty after a job");

    let submitted = stub.submitted();
    assert_eq!(submitted.len(), 1);
    let body = &submitted[0];
    assert_eq!(body["client_id"], "session-a");
    assert_eq!(body["prompt"]["6"]["inputs"]["text"], "make it snow; rm -rf /");
    assert_eq!(body["prompt"]["10"]["inputs"]["image"], "face_reference.png");
    assert_eq!(
        body["prompt"]["12"]["inputs"]["directory"],
        fx.layout.input_dir.join("video_frames").to_string_lossy().into_owned()
    );
}

#[tokio::test]
async fn stale_artifacts_from_a_previous_job_are_removed_first() {
    let fx = Fixture::new();
    std::fs::write(fx.layout.output_dir.join("ResultFrames_00099_.png"), b"stale").unwrap();
    std::fs::write(fx.layout.temp_dir.join("leftover.bin"), b"old").unwrap();

    let (url, _stub) = spawn_comfy(Behavior::WritesFrames(2), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(2));

    let result = runner.run(&Job::new(request()).unwrap(), "s").await.unwrap();

    assert_eq!(decode(&result), "MUXED:2");
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn no_matching_output_is_missing_output_and_still_cleans_up() {
    let fx = Fixture::new();
    let (url, _stub) = spawn_comfy(Behavior::WritesNothing, &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(3));

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::MissingOutput(_));
    assert_eq!(err.stage(), Stage::MissingOutput);
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn frames_are_fetched_remotely_when_output_dir_is_not_shared() {
    let fx = Fixture::new();
    let (url, _stub) = spawn_comfy(Behavior::RemoteOnly(4), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(4));

    let result = runner.run(&Job::new(request()).unwrap(), "s").await.unwrap();

    assert_eq!(decode(&result), "MUXED:4");
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn rejected_submission_never_polls() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::RejectsSubmission, &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(1));

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::SubmissionRejected(_));
    assert_eq!(stub.history_count(), 0);
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn server_side_failure_is_execution_error() {
    let fx = Fixture::new();
    let (url, _stub) = spawn_comfy(Behavior::FailsExecution, &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(1));

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Execution { ref prompt_id, ref message }
        if prompt_id == PROMPT_ID && message == "CUDA out of memory");
    assert_eq!(err.stage(), Stage::Execution);
}

#[tokio::test]
async fn completion_timeout_interrupts_the_server() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::NeverFinishes, &fx.layout.output_dir).await;
    let mut config = fx.config();
    config.completion.timeout = Duration::from_millis(300);
    let runner = fx.runner_with(config, &url, toolkit(1));

    let started = std::time::Instant::now();
    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::CompletionTimeout { .. });
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn unresolvable_input_fails_at_staging() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(1), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(1));

    let mut req = request();
    req.video = InputDescriptor::Path("../outside.mp4".into());
    let err = runner.run(&Job::new(req).unwrap(), "s").await.unwrap_err();

    assert_matches!(err, JobError::InputResolution { input: "video", .. });
    assert!(stub.submitted().is_empty());
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn demux_without_frames_fails_preprocess() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(1), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(0));

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Preprocess);
    assert!(stub.submitted().is_empty());
}

#[tokio::test]
async fn mux_failure_is_postprocess_error() {
    let fx = Fixture::new();
    let (url, _stub) = spawn_comfy(Behavior::WritesFrames(2), &fx.layout.output_dir).await;
    let runner = fx.runner(
        &url,
        StubToolkit {
            frames: 2,
            fail_mux: true,
        },
    );

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Postprocess(_));
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn broken_template_fails_at_submit() {
    let fx = Fixture::new();
    std::fs::write(&fx.template_path, r#"{"slots": {}, "workflow": {"1": {"class_type": "X", "inputs": {}}}}"#).unwrap();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(1), &fx.layout.output_dir).await;
    let runner = fx.runner(&url, toolkit(1));

    let err = runner
        .run(&Job::new(request()).unwrap(), "s")
        .await
        .unwrap_err();

    assert_matches!(err, JobError::MalformedTemplate(_));
    assert_eq!(err.stage(), Stage::Submit);
    assert!(stub.submitted().is_empty());
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orchestrator_returns_exactly_one_of_result_or_error() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(2), &fx.layout.output_dir).await;
    let orchestrator = Arc::new(Orchestrator::new(
        None,
        ComfyUIApi::new(url.clone()),
        fx.runner(&url, toolkit(2)),
    ));

    let ok = orchestrator.handle(request()).await;
    assert_matches!(ok, JobResponse::Result { .. });

    let mut bad = request();
    bad.instruction = "  ".into();
    let err = orchestrator.handle(bad).await;
    assert_matches!(err, JobResponse::Error { ref error } if error.starts_with("staging: "));

    // Same session id for every job of this orchestrator.
    let first = stub.submitted()[0]["client_id"].clone();
    assert_eq!(first, orchestrator.client_id());
    assert!(!orchestrator.fatal_token().is_cancelled());
}

#[tokio::test]
async fn concurrent_jobs_run_one_at_a_time() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(2), &fx.layout.output_dir).await;
    let orchestrator = Arc::new(Orchestrator::new(
        None,
        ComfyUIApi::new(url.clone()),
        fx.runner(&url, toolkit(2)),
    ));

    let a = tokio::spawn({
        let o = Arc::clone(&orchestrator);
        async move { o.handle(request()).await }
    });
    let b = tokio::spawn({
        let o = Arc::clone(&orchestrator);
        async move { o.handle(request()).await }
    });

    assert_matches!(a.await.unwrap(), JobResponse::Result { .. });
    assert_matches!(b.await.unwrap(), JobResponse::Result { .. });
    assert_eq!(stub.submitted().len(), 2);
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn dead_server_fails_job_and_trips_fatal_token() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::WritesFrames(1), &fx.layout.output_dir).await;

    let server = ServerHandle::start(&SupervisorConfig {
        program: "sh".into(),
        args: vec!["-c".into(), "exit 1".into()],
        working_dir: None,
    })
    .unwrap();
    // Let the child exit before the job arrives.
    for _ in 0..100 {
        if server.check_alive().await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let orchestrator = Arc::new(Orchestrator::new(
        Some(Arc::new(server)),
        ComfyUIApi::new(url.clone()),
        fx.runner(&url, toolkit(1)),
    ));
    let token = orchestrator.fatal_token();

    let response = orchestrator.handle(request()).await;

    assert_matches!(response, JobResponse::Error { ref error } if error.starts_with("startup: "));
    assert!(token.is_cancelled());
    assert!(stub.submitted().is_empty());
}

#[tokio::test]
async fn unreachable_attached_server_fails_job_and_trips_fatal_token() {
    let fx = Fixture::new();
    let orchestrator = Arc::new(Orchestrator::new(
        None,
        ComfyUIApi::new("http://127.0.0.1:1"),
        fx.runner("http://127.0.0.1:1", toolkit(1)),
    ));
    let token = orchestrator.fatal_token();

    let response = orchestrator.handle(request()).await;

    assert_matches!(response, JobResponse::Error { ref error } if error.starts_with("startup: "));
    assert!(token.is_cancelled());
    assert_eq!(fx.entry_count(), 0);
}

#[tokio::test]
async fn dropped_caller_does_not_cancel_the_running_job() {
    let fx = Fixture::new();
    let (url, stub) = spawn_comfy(Behavior::NeverFinishes, &fx.layout.output_dir).await;
    let mut config = fx.config();
    config.completion.timeout = Duration::from_millis(400);
    let orchestrator = Arc::new(Orchestrator::new(
        None,
        ComfyUIApi::new(url.clone()),
        fx.runner_with(config, &url, toolkit(1)),
    ));

    let caller = tokio::spawn({
        let o = Arc::clone(&orchestrator);
        async move { o.handle(request()).await }
    });

    // Wait until the workflow is on the server, then walk away.
    for _ in 0..200 {
        if !stub.submitted().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stub.submitted().len(), 1);
    caller.abort();

    // The job still times out on its own and withdraws its prompt.
    for _ in 0..300 {
        if stub.interrupts.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 1);

    // The gate is released and the next job starts on a clean workspace.
    let next = tokio::time::timeout(Duration::from_secs(5), orchestrator.handle(request()))
        .await
        .unwrap();
    assert_matches!(next, JobResponse::Error { ref error } if error.starts_with("timeout: "));
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 2);
    assert_eq!(fx.entry_count(), 0);
}
