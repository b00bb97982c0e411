//! Inference server process supervision.
//!
//! Launches the ComfyUI process, forwards its stdout/stderr into the
//! worker's log stream under the `comfyui_server` target, and waits for
//! the HTTP liveness endpoint to answer. Once ready, the handle is used
//! before every job to verify the process is still alive.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::ComfyUIApi;

/// How to launch the inference server.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// How long, and how often, to probe for readiness.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            probe_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Failed,
    Exited,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Failed => "failed",
            ServerState::Exited => "exited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("inference server exited (code {})", fmt_code(.code))]
    Exited { code: Option<i32> },

    #[error("inference server not ready after {}s", .waited.as_secs())]
    ReadyTimeout { waited: Duration },

    /// An attached server stopped answering its health endpoint.
    #[error("inference server unreachable: {0}")]
    Unreachable(String),

    #[error("failed to inspect inference server process: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// A running inference server process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ServerHandle {
    pid: Option<u32>,
    child: Mutex<Child>,
    state: watch::Sender<ServerState>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Launch the server with the worker's environment.
    pub fn start(config: &SupervisorConfig) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: config.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        tracing::info!(
            pid,
            program = %config.program.display(),
            args = ?config.args,
            "Inference server launched"
        );

        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(forward_lines(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(forward_lines(stderr, "stderr")));
        }

        let (state, _) = watch::channel(ServerState::Starting);

        Ok(Self {
            pid,
            child: Mutex::new(child),
            state,
            log_tasks,
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Probe the health endpoint until it answers 2xx.
    ///
    /// The process is checked before every probe; if it has exited the
    /// wait ends immediately with [`SupervisorError::Exited`].
    pub async fn await_ready(
        self,
        api: &ComfyUIApi,
        readiness: &ReadinessConfig,
    ) -> Result<Self, SupervisorError> {
        let started = Instant::now();
        let deadline = started + readiness.timeout;
        let mut attempts = 0u32;

        loop {
            if let Err(e) = self.check_alive().await {
                self.state.send_replace(ServerState::Failed);
                return Err(e);
            }

            attempts += 1;
            match api.probe_health().await {
                Ok(()) => {
                    self.state.send_replace(ServerState::Ready);
                    tracing::info!(
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Inference server ready"
                    );
                    return Ok(self);
                }
                Err(e) => {
                    tracing::debug!(attempts, error = %e, "Readiness probe failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.state.send_replace(ServerState::Failed);
                return Err(SupervisorError::ReadyTimeout {
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(readiness.probe_interval.min(deadline - now)).await;
        }
    }

    /// Fail if the process has exited since the last check.
    pub async fn check_alive(&self) -> Result<(), SupervisorError> {
        let mut child = self.child.lock().await;
        match child.try_wait()? {
            None => Ok(()),
            Some(status) => {
                self.state.send_replace(ServerState::Exited);
                tracing::error!(pid = self.pid, %status, "Inference server exited");
                Err(SupervisorError::Exited {
                    code: status.code(),
                })
            }
        }
    }

    /// Kill the process and wait for it, then stop the log forwarders.
    pub async fn shutdown(&self) {
        {
            let mut child = self.child.lock().await;
            if let Ok(None) = child.try_wait() {
                tracing::info!(pid = self.pid, "Stopping inference server");
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to kill inference server");
                }
            }
        }
        self.state.send_replace(ServerState::Exited);

        for task in &self.log_tasks {
            task.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        for task in &self.log_tasks {
            task.abort();
        }
    }
}

/// Probe an externally managed server until it answers 2xx.
pub async fn await_external_ready(
    api: &ComfyUIApi,
    readiness: &ReadinessConfig,
) -> Result<(), SupervisorError> {
    let started = Instant::now();
    let deadline = started + readiness.timeout;

    loop {
        match api.probe_health().await {
            Ok(()) => {
                tracing::info!(url = api.api_url(), "Attached to running inference server");
                return Ok(());
            }
            Err(e) => tracing::debug!(error = %e, "Readiness probe failed"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SupervisorError::ReadyTimeout {
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(readiness.probe_interval.min(deadline - now)).await;
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "comfyui_server", stream, "{line}");
                }
            }
            Err(e) => {
                tracing::warn!(target: "comfyui_server", stream, error = %e, "Log forwarding stopped");
                break;
            }
        }
    }
}
