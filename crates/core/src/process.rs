//! Bounded subprocess execution.
//!
//! Provides [`run_command`], the common spawn + capture + timeout logic
//! used by every external collaborator call (FFmpeg, FFprobe). Callers
//! build a [`tokio::process::Command`] from an explicit argument list and
//! delegate the rest here. No shell is ever involved, so filenames and
//! instruction text are passed through untouched.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Number of trailing stderr bytes kept in [`CommandError::Failed`].
const STDERR_TAIL_BYTES: usize = 4096;

/// Captured stdout of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
}

/// Errors from running an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be spawned (missing binary, permissions).
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The command exceeded its timeout and was killed.
    #[error("{program} timed out after {elapsed_ms}ms")]
    Timeout { program: String, elapsed_ms: u64 },

    /// The command ran but exited unsuccessfully.
    #[error("{program} failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        program: String,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        /// Tail of the captured stderr.
        stderr: String,
    },

    /// Waiting on the child failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// Spawn `cmd`, capture stdout/stderr and enforce `timeout`.
///
/// Stdin is closed. The child is killed if the timeout fires (the
/// command is configured with `kill_on_drop(true)`). A non-zero exit
/// status is returned as [`CommandError::Failed`] with the tail of
/// stderr attached.
pub async fn run_command(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain both pipes concurrently so a chatty child never blocks on a
    // full pipe while we wait on it.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match wait_result {
        Ok(Ok(status)) => {
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

            if !status.success() {
                return Err(CommandError::Failed {
                    program,
                    exit_code: status.code(),
                    stderr: tail(&stderr, STDERR_TAIL_BYTES).trim().to_string(),
                });
            }

            tracing::debug!(program = %program, duration_ms, "Command finished");

            Ok(CommandOutput { stdout })
        }
        Ok(Err(source)) => Err(CommandError::Io { program, source }),
        Err(_elapsed) => Err(CommandError::Timeout {
            program,
            elapsed_ms: duration_ms,
        }),
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
