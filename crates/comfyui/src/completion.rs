//! Waiting for a submitted prompt to finish.
//!
//! Two strategies sit behind [`await_completion`]:
//!
//! * **Poll** -- query the status endpoint at a fixed interval. Simple
//!   and robust at the cost of up to one interval of extra latency.
//! * **Push** -- listen on the WebSocket channel keyed by the session id
//!   and wake on the completion frame, still querying status at the poll
//!   interval. Any channel failure drops back to plain polling.
//!
//! Both apply one overall deadline. A failed status query (connection
//! refused, 5xx, malformed body) counts as "not yet complete"; only the
//! deadline ends the wait without an answer.

use std::time::Duration;

use tokio::time::Instant;

use crate::api::{ComfyUIApiError, SubmissionReceipt};
use crate::client::{ComfyUIClientError, PushChannel};
use crate::history::{OutputManifest, PromptStatus};
use crate::messages::{FrameOutcome, PushFrame};

/// Anything that can report the status of a tracked prompt.
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync {
    async fn query_status(&self, prompt_id: &str) -> Result<PromptStatus, ComfyUIApiError>;
}

/// How completion is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStrategy {
    Poll,
    /// Push channel at the given WebSocket base URL (e.g. `ws://host:8188`).
    Push { ws_url: String },
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Overall deadline for the wait.
    pub timeout: Duration,
    /// Interval between status queries.
    pub poll_interval: Duration,
    pub strategy: CompletionStrategy,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("prompt {prompt_id} did not complete within {}s", .elapsed.as_secs())]
    Timeout {
        prompt_id: String,
        elapsed: Duration,
    },

    #[error("prompt {prompt_id} failed on the server: {message}")]
    ExecutionFailed { prompt_id: String, message: String },
}

/// Block until the prompt in `receipt` finishes, fails, or the timeout
/// elapses. Returns the output manifest on success.
///
/// A [`CompletionError::Timeout`] is only returned once the full timeout
/// has elapsed.
pub async fn await_completion<S: StatusSource + ?Sized>(
    source: &S,
    receipt: &SubmissionReceipt,
    options: &CompletionOptions,
) -> Result<OutputManifest, CompletionError> {
    let start = Instant::now();
    let deadline = start + options.timeout;

    tracing::info!(
        prompt_id = %receipt.prompt_id,
        timeout_secs = options.timeout.as_secs(),
        poll_interval_ms = options.poll_interval.as_millis() as u64,
        strategy = ?options.strategy,
        "Waiting for prompt completion",
    );

    match &options.strategy {
        CompletionStrategy::Poll => {
            poll_until(source, receipt, options.poll_interval, start, deadline).await
        }
        CompletionStrategy::Push { ws_url } => {
            push_until(source, receipt, ws_url, options.poll_interval, start, deadline).await
        }
    }
}

/// Fixed-interval status polling until `deadline`.
async fn poll_until<S: StatusSource + ?Sized>(
    source: &S,
    receipt: &SubmissionReceipt,
    interval: Duration,
    start: Instant,
    deadline: Instant,
) -> Result<OutputManifest, CompletionError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(done) = query_once(source, receipt, attempt, deadline).await {
            return done;
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timeout_error(receipt, start));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// What woke the push loop.
enum Wake {
    Deadline,
    Tick,
    Frame(Option<Result<PushFrame, ComfyUIClientError>>),
}

/// Push-channel wait with status queries as a safety net.
///
/// The first tick fires immediately, which also catches a prompt that
/// finished before the channel was opened.
async fn push_until<S: StatusSource + ?Sized>(
    source: &S,
    receipt: &SubmissionReceipt,
    ws_url: &str,
    interval: Duration,
    start: Instant,
    deadline: Instant,
) -> Result<OutputManifest, CompletionError> {
    let connect = tokio::time::timeout_at(
        deadline,
        PushChannel::connect(ws_url, &receipt.client_id),
    )
    .await;

    let mut channel = match connect {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            tracing::warn!(prompt_id = %receipt.prompt_id, error = %e, "Push channel unavailable, polling instead");
            return poll_until(source, receipt, interval, start, deadline).await;
        }
        Err(_) => return Err(timeout_error(receipt, start)),
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut attempt = 0u32;

    loop {
        let wake = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            _ = ticker.tick() => Wake::Tick,
            frame = channel.next_frame() => Wake::Frame(frame),
        };

        match wake {
            Wake::Deadline => return Err(timeout_error(receipt, start)),
            Wake::Tick => {
                attempt += 1;
                if let Some(done) = query_once(source, receipt, attempt, deadline).await {
                    return done;
                }
            }
            Wake::Frame(Some(Ok(frame))) => match frame.outcome_for(&receipt.prompt_id) {
                Some(FrameOutcome::Finished) => {
                    tracing::info!(prompt_id = %receipt.prompt_id, "Completion frame received");
                    attempt += 1;
                    if let Some(done) = query_once(source, receipt, attempt, deadline).await {
                        return done;
                    }
                    // History not visible yet; the ticker picks it up.
                }
                Some(FrameOutcome::Failed(message)) => {
                    return Err(CompletionError::ExecutionFailed {
                        prompt_id: receipt.prompt_id.clone(),
                        message,
                    });
                }
                None => log_progress(&frame),
            },
            Wake::Frame(Some(Err(e))) => {
                tracing::warn!(prompt_id = %receipt.prompt_id, error = %e, "Push channel error, falling back to polling");
                return poll_until(source, receipt, interval, start, deadline).await;
            }
            Wake::Frame(None) => {
                tracing::warn!(prompt_id = %receipt.prompt_id, "Push channel closed, falling back to polling");
                return poll_until(source, receipt, interval, start, deadline).await;
            }
        }
    }
}

/// One status query. `Some` ends the wait; `None` means keep waiting.
async fn query_once<S: StatusSource + ?Sized>(
    source: &S,
    receipt: &SubmissionReceipt,
    attempt: u32,
    deadline: Instant,
) -> Option<Result<OutputManifest, CompletionError>> {
    let prompt_id = receipt.prompt_id.as_str();

    match tokio::time::timeout_at(deadline, source.query_status(prompt_id)).await {
        Ok(Ok(PromptStatus::Completed(manifest))) => {
            tracing::info!(
                prompt_id,
                attempt,
                files = manifest.files.len(),
                "Prompt completed",
            );
            Some(Ok(manifest))
        }
        Ok(Ok(PromptStatus::Failed { message })) => {
            tracing::error!(prompt_id, attempt, error = %message, "Prompt failed on server");
            Some(Err(CompletionError::ExecutionFailed {
                prompt_id: prompt_id.to_string(),
                message,
            }))
        }
        Ok(Ok(PromptStatus::Pending)) => {
            tracing::debug!(prompt_id, attempt, "Prompt still pending");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(prompt_id, attempt, error = %e, "Status query failed, will retry");
            None
        }
        Err(_) => None,
    }
}

fn timeout_error(receipt: &SubmissionReceipt, start: Instant) -> CompletionError {
    CompletionError::Timeout {
        prompt_id: receipt.prompt_id.clone(),
        elapsed: start.elapsed(),
    }
}

fn log_progress(frame: &PushFrame) {
    match frame {
        PushFrame::Progress { value, max } if *max > 0 => {
            tracing::debug!(value, max, percent = value * 100 / max, "Generation progress");
        }
        PushFrame::Executing {
            node: Some(node), ..
        } => tracing::debug!(node = %node, "Executing node"),
        PushFrame::Status { queue_remaining } => {
            tracing::debug!(?queue_remaining, "Queue status");
        }
        _ => {}
    }
}
