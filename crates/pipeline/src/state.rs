//! Pipeline state machine.
//!
//! States advance strictly forward:
//! `Idle -> InputsStaged -> PreProcessed -> Submitted -> Completed ->
//! PostProcessed -> Packaged -> Done`. `Failed` is reachable from any
//! non-terminal state and absorbs.

use std::fmt;

use tokio::time::Instant;

use framesmith_core::types::JobId;

use crate::error::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    InputsStaged,
    PreProcessed,
    Submitted,
    Completed,
    PostProcessed,
    Packaged,
    Done,
    Failed(Stage),
}

impl PipelineState {
    /// The only forward state reachable from here.
    pub fn successor(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Idle => Some(InputsStaged),
            InputsStaged => Some(PreProcessed),
            PreProcessed => Some(Submitted),
            Submitted => Some(Completed),
            Completed => Some(PostProcessed),
            PostProcessed => Some(Packaged),
            Packaged => Some(Done),
            Done | Failed(_) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }

    pub fn can_advance_to(self, next: PipelineState) -> bool {
        match next {
            PipelineState::Failed(_) => !self.is_terminal(),
            _ => self.successor() == Some(next),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::InputsStaged => f.write_str("inputs_staged"),
            PipelineState::PreProcessed => f.write_str("pre_processed"),
            PipelineState::Submitted => f.write_str("submitted"),
            PipelineState::Completed => f.write_str("completed"),
            PipelineState::PostProcessed => f.write_str("post_processed"),
            PipelineState::Packaged => f.write_str("packaged"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}

/// Transition an illegal state change was attempted with.
#[derive(Debug, thiserror::Error)]
#[error("illegal pipeline transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Tracks one job's progress and logs every transition.
#[derive(Debug)]
pub struct StateTracker {
    job_id: JobId,
    state: PipelineState,
    entered_at: Instant,
}

impl StateTracker {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: PipelineState::Idle,
            entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<(), IllegalTransition> {
        if !self.state.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        let elapsed_ms = self.entered_at.elapsed().as_millis() as u64;
        match next {
            PipelineState::Failed(stage) => tracing::warn!(
                job_id = %self.job_id,
                from = %self.state,
                %stage,
                elapsed_ms,
                "Pipeline failed",
            ),
            _ => tracing::info!(
                job_id = %self.job_id,
                from = %self.state,
                to = %next,
                elapsed_ms,
                "Pipeline advanced",
            ),
        }

        self.state = next;
        self.entered_at = Instant::now();
        Ok(())
    }
}
