//! ComfyUI inference-server integration.
//!
//! Provides the REST client used for workflow submission and status
//! queries, the WebSocket push channel and its frame parser, the
//! completion waiter (polling or push), the workflow template binder,
//! and the supervisor that owns the server subprocess.

pub mod api;
pub mod client;
pub mod completion;
pub mod history;
pub mod messages;
pub mod supervisor;
pub mod workflow;
