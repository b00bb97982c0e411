//! Media toolkit seam.
//!
//! The pipeline only needs two operations from the media toolkit: split
//! a staged video into a frame sequence plus its audio track, and join a
//! result frame sequence back into a video with that audio. The default
//! implementation shells out to FFmpeg with explicit argument lists.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use framesmith_core::ffmpeg::{self, FfmpegError};

/// File name pattern of extracted input frames.
pub const INPUT_FRAME_PATTERN: &str = "frame_%05d.png";

/// File name of the demuxed audio track inside the scratch directory.
const AUDIO_FILE: &str = "source_audio.mka";

/// File name of the intermediate video-only encode.
const SILENT_FILE: &str = "silent_encode.mp4";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error("expected output missing: {0}")]
    MissingOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What demuxing produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxOutput {
    pub frames_dir: PathBuf,
    pub frame_count: usize,
    /// Source framerate as probed (`"24000/1001"`), when known.
    pub framerate: Option<String>,
    /// Extracted audio track, when the source had one.
    pub audio: Option<PathBuf>,
}

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Extract the frames of `video` into `frames_dir` and its first audio
    /// stream (if any) into `scratch_dir`.
    async fn demux(
        &self,
        video: &Path,
        frames_dir: &Path,
        scratch_dir: &Path,
    ) -> Result<DemuxOutput, MediaError>;

    /// Encode the printf-style `frame_pattern` sequence into `output`,
    /// re-attaching the audio from `source` and truncating to the shorter
    /// stream.
    async fn mux(
        &self,
        frame_pattern: &Path,
        source: &DemuxOutput,
        output: &Path,
    ) -> Result<(), MediaError>;
}

/// [`MediaToolkit`] backed by the `ffmpeg`/`ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    /// Bound for each individual ffmpeg/ffprobe invocation.
    pub timeout: Duration,
    /// Used when the source framerate is unknown.
    pub fallback_framerate: f64,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            fallback_framerate: 24.0,
        }
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn demux(
        &self,
        video: &Path,
        frames_dir: &Path,
        scratch_dir: &Path,
    ) -> Result<DemuxOutput, MediaError> {
        let probe = ffmpeg::probe_video(video, self.timeout).await?;

        let framerate = ffmpeg::probed_frame_rate(&probe);

        let audio = if ffmpeg::has_audio(&probe) {
            let audio_path = scratch_dir.join(AUDIO_FILE);
            ffmpeg::extract_audio(video, &audio_path, self.timeout).await?;
            Some(audio_path)
        } else {
            tracing::info!(video = %video.display(), "Source has no audio track");
            None
        };

        ffmpeg::extract_frames(video, frames_dir, INPUT_FRAME_PATTERN, self.timeout).await?;
        let frame_count = count_files(frames_dir).await?;

        tracing::info!(frame_count, ?framerate, has_audio = audio.is_some(), "Video demuxed");

        Ok(DemuxOutput {
            frames_dir: frames_dir.to_path_buf(),
            frame_count,
            framerate,
            audio,
        })
    }

    async fn mux(
        &self,
        frame_pattern: &Path,
        source: &DemuxOutput,
        output: &Path,
    ) -> Result<(), MediaError> {
        let framerate = source
            .framerate
            .clone()
            .unwrap_or_else(|| ffmpeg::format_framerate(self.fallback_framerate));

        let Some(audio) = &source.audio else {
            ffmpeg::encode_frames(frame_pattern, &framerate, output, self.timeout).await?;
            return Ok(());
        };

        let silent = output.with_file_name(SILENT_FILE);
        ffmpeg::encode_frames(frame_pattern, &framerate, &silent, self.timeout).await?;
        ffmpeg::attach_audio(&silent, audio, output, self.timeout).await?;
        tokio::fs::remove_file(&silent).await?;
        Ok(())
    }
}

/// Number of regular files directly inside `dir`.
pub async fn count_files(dir: &Path) -> Result<usize, std::io::Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}
