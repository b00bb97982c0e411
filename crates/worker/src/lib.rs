//! HTTP front end for the framesmith job orchestrator.
//!
//! The binary in `main.rs` loads [`config::WorkerConfig`], brings the
//! inference server up via [`startup`], and serves [`app::build_app`].

pub mod app;
pub mod config;
pub mod error;
pub mod routes;
pub mod startup;
pub mod state;
