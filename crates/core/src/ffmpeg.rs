//! FFmpeg/FFprobe command wrappers.
//!
//! Every call builds an explicit argument list and runs through
//! [`run_command`](crate::process::run_command), so user-supplied
//! filenames never pass through a shell.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::process::{run_command, CommandError};

const FFMPEG_BIN: &str = "ffmpeg";
const FFPROBE_BIN: &str = "ffprobe";

/// Error type for FFmpeg/FFprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("video file not found: {0}")]
    VideoNotFound(String),
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

/// A single stream from ffprobe output.
#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub index: i32,
    pub codec_name: Option<String>,
    pub codec_type: Option<String>,
    /// e.g. "30/1" or "24000/1001"
    pub r_frame_rate: Option<String>,
    pub channels: Option<i32>,
}

/// Format-level metadata from ffprobe.
#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
    pub format_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run `ffprobe` on a video file and return the parsed JSON output.
pub async fn probe_video(path: &Path, timeout: Duration) -> Result<FfprobeOutput, FfmpegError> {
    ensure_exists(path)?;

    let mut cmd = Command::new(FFPROBE_BIN);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = run_command(&mut cmd, timeout).await?;
    serde_json::from_str::<FfprobeOutput>(&output.stdout)
        .map_err(|e| FfmpegError::ParseError(format!("{e}: {}", output.stdout)))
}

/// Copy the first audio stream of `video_path` into `audio_path` without
/// re-encoding. The output container should accept any codec (`.mka`).
pub async fn extract_audio(
    video_path: &Path,
    audio_path: &Path,
    timeout: Duration,
) -> Result<(), FfmpegError> {
    ensure_exists(video_path)?;

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video_path.into(),
        "-vn".into(),
        "-map".into(),
        "0:a:0".into(),
        "-c:a".into(),
        "copy".into(),
        audio_path.into(),
    ];
    run_ffmpeg(args, timeout).await
}

/// Extract every frame of `video_path` as PNG files named by
/// `file_pattern` (printf-style, e.g. `frame_%05d.png`) inside
/// `frames_dir`. The directory is created if missing.
pub async fn extract_frames(
    video_path: &Path,
    frames_dir: &Path,
    file_pattern: &str,
    timeout: Duration,
) -> Result<(), FfmpegError> {
    ensure_exists(video_path)?;
    tokio::fs::create_dir_all(frames_dir).await?;

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video_path.into(),
        frames_dir.join(file_pattern).into(),
    ];
    run_ffmpeg(args, timeout).await
}

/// Encode a numbered image sequence into an H.264 video.
///
/// `frame_pattern` is the printf-style input path, e.g.
/// `/tmp/work/frames/frame_%06d.png`. `framerate` is passed to
/// `-framerate` as given, so a probed fraction like `24000/1001` stays
/// exact.
pub async fn encode_frames(
    frame_pattern: &Path,
    framerate: &str,
    output_path: &Path,
    timeout: Duration,
) -> Result<(), FfmpegError> {
    let args: Vec<OsString> = vec![
        "-y".into(),
        "-framerate".into(),
        framerate.into(),
        "-i".into(),
        frame_pattern.into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        output_path.into(),
    ];
    run_ffmpeg(args, timeout).await
}

/// Mux `audio_path` onto `video_path`, re-encoding audio to AAC and
/// truncating to the shorter of the two streams.
pub async fn attach_audio(
    video_path: &Path,
    audio_path: &Path,
    output_path: &Path,
    timeout: Duration,
) -> Result<(), FfmpegError> {
    ensure_exists(video_path)?;

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video_path.into(),
        "-i".into(),
        audio_path.into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-shortest".into(),
        output_path.into(),
    ];
    run_ffmpeg(args, timeout).await
}

async fn run_ffmpeg(args: Vec<OsString>, timeout: Duration) -> Result<(), FfmpegError> {
    let mut cmd = Command::new(FFMPEG_BIN);
    cmd.args(["-hide_banner", "-loglevel", "error"]).args(args);
    run_command(&mut cmd, timeout).await?;
    Ok(())
}

fn ensure_exists(path: &Path) -> Result<(), FfmpegError> {
    if !path.exists() {
        return Err(FfmpegError::VideoNotFound(
            path.to_string_lossy().to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Find the first video stream in the ffprobe output.
fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// The first video stream's `r_frame_rate` exactly as ffprobe reported
/// it (`"30/1"`, `"24000/1001"`).
///
/// `None` when missing or not a positive rate (ffprobe reports `"0/0"`
/// for unknown).
pub fn probed_frame_rate(probe: &FfprobeOutput) -> Option<String> {
    first_video_stream(probe)
        .and_then(|s| s.r_frame_rate.as_deref())
        .map(str::trim)
        .filter(|rate| parse_fraction(rate) > 0.0)
        .map(str::to_string)
}

/// Whether the probed file carries at least one audio stream.
pub fn has_audio(probe: &FfprobeOutput) -> bool {
    probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"))
}

/// Parse a fraction string like `"30/1"` into a float.
fn parse_fraction(s: &str) -> f64 {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num = parts[0].parse::<f64>().unwrap_or(0.0);
        let den = parts[1].parse::<f64>().unwrap_or(1.0);
        if den > 0.0 {
            return num / den;
        }
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// Render a configured framerate for the `-framerate` flag without
/// float noise.
pub fn format_framerate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{fps:.3}")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn stream(index: i32, codec_type: &str, rate: Option<&str>) -> FfprobeStream {
        FfprobeStream {
            index,
            codec_name: None,
            codec_type: Some(codec_type.into()),
            r_frame_rate: rate.map(Into::into),
            channels: None,
        }
    }

    fn probe(streams: Vec<FfprobeStream>) -> FfprobeOutput {
        FfprobeOutput {
            streams,
            format: FfprobeFormat {
                duration: None,
                format_name: None,
            },
        }
    }

    #[test]
    fn test_parse_fraction_standard() {
        assert!((parse_fraction("30/1") - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_fraction_ntsc() {
        let fps = parse_fraction("24000/1001");
        assert!((fps - 23.976).abs() < 0.01);
    }

    #[test]
    fn test_parse_fraction_zero_denominator() {
        assert!((parse_fraction("30/0") - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_probed_frame_rate_uses_first_video_stream() {
        let p = probe(vec![
            stream(0, "audio", None),
            stream(1, "video", Some("25/1")),
        ]);
        assert_eq!(probed_frame_rate(&p).as_deref(), Some("25/1"));
    }

    #[test]
    fn test_probed_frame_rate_keeps_ntsc_fraction_exact() {
        let p = probe(vec![stream(0, "video", Some("24000/1001"))]);
        assert_eq!(probed_frame_rate(&p).as_deref(), Some("24000/1001"));
    }

    #[test]
    fn test_probed_frame_rate_unknown_is_none() {
        assert_eq!(probed_frame_rate(&probe(vec![stream(0, "video", None)])), None);
        assert_eq!(
            probed_frame_rate(&probe(vec![stream(0, "video", Some("0/0"))])),
            None
        );
    }

    #[test]
    fn test_has_audio() {
        assert!(has_audio(&probe(vec![
            stream(0, "video", Some("30/1")),
            stream(1, "audio", None),
        ])));
        assert!(!has_audio(&probe(vec![stream(0, "video", Some("30/1"))])));
    }

    #[test]
    fn test_format_framerate() {
        assert_eq!(format_framerate(24.0), "24");
        assert_eq!(format_framerate(23.976_023), "23.976");
    }

    #[test]
    fn test_deserialize_ffprobe_json() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_name": "h264", "codec_type": "video", "r_frame_rate": "30/1"},
                {"index": 1, "codec_name": "aac", "codec_type": "audio", "channels": 2}
            ],
            "format": {"duration": "4.000000", "format_name": "mov,mp4,m4a,3gp,3g2,mj2"}
        }"#;
        let p: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(p.streams.len(), 2);
        assert!(has_audio(&p));
        assert_eq!(probed_frame_rate(&p).as_deref(), Some("30/1"));
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let err = probe_video(Path::new("/nonexistent/clip.mp4"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, FfmpegError::VideoNotFound(_));
    }
}
