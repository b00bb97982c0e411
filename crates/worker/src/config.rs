use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use framesmith_comfyui::client::ws_url_for;
use framesmith_comfyui::completion::{CompletionOptions, CompletionStrategy};
use framesmith_comfyui::supervisor::{ReadinessConfig, SupervisorConfig};
use framesmith_core::error::CoreError;
use framesmith_core::workspace::WorkspaceLayout;
use framesmith_pipeline::config::{PipelineConfig, DEFAULT_OUTPUT_PATTERN};
use framesmith_pipeline::media::FfmpegToolkit;

/// How completion of a submitted prompt is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Poll,
    Push,
}

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults matching the stock container image.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted `/run` body, in bytes. Inline videos are big.
    pub max_body_bytes: usize,
    pub comfyui_url: String,
    /// ComfyUI install root; `input/` and `output/` live below it.
    pub comfyui_path: PathBuf,
    /// Launch command. `None` attaches to an already running server.
    pub comfyui_command: Option<PathBuf>,
    pub comfyui_args: Vec<String>,
    pub health_path: String,
    pub ready_timeout: Duration,
    pub ready_probe_interval: Duration,
    pub workflow_template: PathBuf,
    pub work_dir: PathBuf,
    pub staged_input_dir: Option<PathBuf>,
    pub completion_mode: CompletionMode,
    pub poll_interval: Duration,
    pub completion_timeout: Duration,
    pub download_timeout: Duration,
    pub artifact_timeout: Duration,
    pub media_timeout: Duration,
    pub output_pattern: Regex,
    pub fallback_framerate: f64,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                        |
    /// |-----------------------------|--------------------------------|
    /// | `HOST`                      | `0.0.0.0`                      |
    /// | `PORT`                      | `8000`                         |
    /// | `MAX_BODY_MB`               | `512`                          |
    /// | `COMFYUI_URL`               | `http://127.0.0.1:8188`        |
    /// | `COMFYUI_PATH`              | `/ComfyUI`                     |
    /// | `COMFYUI_COMMAND`           | unset (attach mode)            |
    /// | `COMFYUI_ARGS`              | empty                          |
    /// | `COMFYUI_HEALTH_PATH`       | `/system_stats`                |
    /// | `READY_TIMEOUT_SECS`        | `600`                          |
    /// | `READY_PROBE_INTERVAL_SECS` | `2`                            |
    /// | `WORKFLOW_TEMPLATE`         | `/workflow_template.json`      |
    /// | `WORK_DIR`                  | `/tmp/framesmith-workspace`    |
    /// | `STAGED_INPUT_DIR`          | unset (path inputs disabled)   |
    /// | `COMPLETION_STRATEGY`       | `poll` (`poll` or `push`)      |
    /// | `POLL_INTERVAL_SECS`        | `5`                            |
    /// | `COMPLETION_TIMEOUT_SECS`   | `7200`                         |
    /// | `DOWNLOAD_TIMEOUT_SECS`     | `600`                          |
    /// | `ARTIFACT_TIMEOUT_SECS`     | `600`                          |
    /// | `MEDIA_TIMEOUT_SECS`        | `1800`                         |
    /// | `OUTPUT_PATTERN`            | `^ResultFrames_\d+_?\.png$`    |
    /// | `FALLBACK_FRAMERATE`        | `24`                           |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let string = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let comfyui_path = PathBuf::from(string("COMFYUI_PATH", "/ComfyUI"));

        let completion_mode = match string("COMPLETION_STRATEGY", "poll").to_ascii_lowercase().as_str() {
            "poll" => CompletionMode::Poll,
            "push" => CompletionMode::Push,
            other => {
                return Err(CoreError::Config(format!(
                    "COMPLETION_STRATEGY must be 'poll' or 'push', got '{other}'"
                )))
            }
        };

        let pattern = string("OUTPUT_PATTERN", DEFAULT_OUTPUT_PATTERN);
        let output_pattern = Regex::new(&pattern)
            .map_err(|e| CoreError::Config(format!("OUTPUT_PATTERN is not a valid regex: {e}")))?;

        let fallback_framerate: f64 = parse(&var, "FALLBACK_FRAMERATE", 24.0)?;
        if fallback_framerate <= 0.0 {
            return Err(CoreError::Config("FALLBACK_FRAMERATE must be positive".into()));
        }

        let poll_interval = secs(&var, "POLL_INTERVAL_SECS", 5)?;
        if poll_interval.is_zero() {
            return Err(CoreError::Config("POLL_INTERVAL_SECS must be at least 1".into()));
        }

        let max_body_bytes = parse::<usize, _>(&var, "MAX_BODY_MB", 512)?
            .checked_mul(1024 * 1024)
            .ok_or_else(|| CoreError::Config("MAX_BODY_MB is too large".into()))?;

        Ok(Self {
            host: string("HOST", "0.0.0.0"),
            port: parse(&var, "PORT", 8000)?,
            max_body_bytes,
            comfyui_url: string("COMFYUI_URL", "http://127.0.0.1:8188"),
            comfyui_command: var("COMFYUI_COMMAND").map(PathBuf::from),
            comfyui_args: var("COMFYUI_ARGS")
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            health_path: string("COMFYUI_HEALTH_PATH", "/system_stats"),
            ready_timeout: secs(&var, "READY_TIMEOUT_SECS", 600)?,
            ready_probe_interval: secs(&var, "READY_PROBE_INTERVAL_SECS", 2)?,
            workflow_template: PathBuf::from(string("WORKFLOW_TEMPLATE", "/workflow_template.json")),
            work_dir: PathBuf::from(string("WORK_DIR", "/tmp/framesmith-workspace")),
            staged_input_dir: var("STAGED_INPUT_DIR").map(PathBuf::from),
            completion_mode,
            poll_interval,
            completion_timeout: secs(&var, "COMPLETION_TIMEOUT_SECS", 7200)?,
            download_timeout: secs(&var, "DOWNLOAD_TIMEOUT_SECS", 600)?,
            artifact_timeout: secs(&var, "ARTIFACT_TIMEOUT_SECS", 600)?,
            media_timeout: secs(&var, "MEDIA_TIMEOUT_SECS", 1800)?,
            output_pattern,
            fallback_framerate,
            comfyui_path,
        })
    }

    /// Launch settings, or `None` in attach mode.
    pub fn supervisor(&self) -> Option<SupervisorConfig> {
        self.comfyui_command.as_ref().map(|program| SupervisorConfig {
            program: program.clone(),
            args: self.comfyui_args.clone(),
            working_dir: Some(self.comfyui_path.clone()).filter(|p| p.is_dir()),
        })
    }

    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            timeout: self.ready_timeout,
            probe_interval: self.ready_probe_interval,
        }
    }

    pub fn workspace_layout(&self) -> WorkspaceLayout {
        WorkspaceLayout {
            input_dir: self.comfyui_path.join("input"),
            output_dir: self.comfyui_path.join("output"),
            temp_dir: self.work_dir.clone(),
        }
    }

    pub fn completion(&self) -> CompletionOptions {
        let strategy = match self.completion_mode {
            CompletionMode::Poll => CompletionStrategy::Poll,
            CompletionMode::Push => CompletionStrategy::Push {
                ws_url: ws_url_for(&self.comfyui_url),
            },
        };
        CompletionOptions {
            timeout: self.completion_timeout,
            poll_interval: self.poll_interval,
            strategy,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            workspace: self.workspace_layout(),
            template_path: self.workflow_template.clone(),
            staged_input_root: self.staged_input_dir.clone(),
            download_timeout: self.download_timeout,
            artifact_timeout: self.artifact_timeout,
            completion: self.completion(),
            output_pattern: self.output_pattern.clone(),
        }
    }

    pub fn toolkit(&self) -> FfmpegToolkit {
        FfmpegToolkit {
            timeout: self.media_timeout,
            fallback_framerate: self.fallback_framerate,
        }
    }
}

fn parse<T, V>(var: &V, key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

fn secs<V>(var: &V, key: &str, default: u64) -> Result<Duration, CoreError>
where
    V: Fn(&str) -> Option<String>,
{
    parse(var, key, default).map(Duration::from_secs)
}
