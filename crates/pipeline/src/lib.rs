//! Job pipeline for a single media-transformation request.
//!
//! A [`job::JobRequest`] flows through the [`runner::StageRunner`]:
//! inputs are staged into the workspace, demuxed by the media toolkit,
//! bound into the workflow template and submitted to ComfyUI, awaited,
//! collected, re-muxed and finally packaged as base64. The
//! [`orchestrator::Orchestrator`] serialises jobs and gates each one on
//! the inference server still being alive.

pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod orchestrator;
pub mod outputs;
pub mod runner;
pub mod staging;
pub mod state;
