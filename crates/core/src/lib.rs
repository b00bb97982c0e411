//! Shared building blocks for the framesmith job orchestrator.
//!
//! Holds the domain types and errors used across crates, the bounded
//! subprocess runner, the FFmpeg/FFprobe command wrappers used by the
//! media toolkit, and the job-scoped workspace manager.

pub mod error;
pub mod ffmpeg;
pub mod process;
pub mod types;
pub mod workspace;
