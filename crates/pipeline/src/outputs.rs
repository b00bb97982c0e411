//! Result frame collection.
//!
//! After the server reports completion, result frames are looked up in
//! the local output directory (and any subfolders named by the output
//! manifest), falling back to fetching manifest entries over `/view`
//! when the output directory is not shared with this worker. Whatever is
//! found is copied into a contiguous `frame_%06d.png` sequence for the
//! muxer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use framesmith_comfyui::api::ComfyUIApi;
use framesmith_comfyui::history::{OutputFile, OutputManifest};

use crate::error::JobError;

/// File name pattern of the renumbered result sequence.
pub const RESULT_FRAME_PATTERN: &str = "frame_%06d.png";

fn result_frame_name(index: usize) -> String {
    format!("frame_{index:06}.png")
}

/// Local files under `output_dir` whose name matches `pattern`, sorted.
///
/// Searches `output_dir` itself plus every subfolder named in the
/// manifest.
pub async fn scan_local(
    output_dir: &Path,
    manifest: &OutputManifest,
    pattern: &Regex,
) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
    dirs.insert(output_dir.to_path_buf());
    for file in &manifest.files {
        if !file.subfolder.is_empty() && is_plain_relative(&file.subfolder) {
            dirs.insert(output_dir.join(&file.subfolder));
        }
    }

    let mut found = Vec::new();
    for dir in dirs {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if pattern.is_match(&name.to_string_lossy()) {
                found.push(entry.path());
            }
        }
    }

    found.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(found)
}

/// Manifest entries whose file name matches `pattern`, sorted by name.
pub fn matching_manifest_entries<'a>(
    manifest: &'a OutputManifest,
    pattern: &Regex,
) -> Vec<&'a OutputFile> {
    let mut files: Vec<&OutputFile> = manifest
        .files
        .iter()
        .filter(|f| pattern.is_match(&f.filename))
        .collect();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    files
}

/// Gather result frames into `sequence_dir` as `frame_000001.png`, ...
///
/// Returns the number of frames. No matching frame anywhere, or remote
/// fetches that do not finish within `fetch_timeout`, is
/// [`JobError::MissingOutput`].
pub async fn collect_result_frames(
    api: &ComfyUIApi,
    output_dir: &Path,
    manifest: &OutputManifest,
    pattern: &Regex,
    sequence_dir: &Path,
    fetch_timeout: Duration,
) -> Result<usize, JobError> {
    let io_err = |e: std::io::Error| JobError::MissingOutput(format!("cannot read results: {e}"));

    tokio::fs::create_dir_all(sequence_dir).await.map_err(io_err)?;

    let local = scan_local(output_dir, manifest, pattern).await.map_err(io_err)?;
    if !local.is_empty() {
        for (i, path) in local.iter().enumerate() {
            tokio::fs::copy(path, sequence_dir.join(result_frame_name(i + 1)))
                .await
                .map_err(io_err)?;
        }
        tracing::info!(frames = local.len(), dir = %output_dir.display(), "Collected local result frames");
        return Ok(local.len());
    }

    let remote = matching_manifest_entries(manifest, pattern);
    if remote.is_empty() {
        return Err(JobError::MissingOutput(format!(
            "no file matching {} in {} or the output manifest ({} entries)",
            pattern.as_str(),
            output_dir.display(),
            manifest.files.len()
        )));
    }

    let fetch = async {
        for (i, file) in remote.iter().enumerate() {
            api.download_artifact(file, &sequence_dir.join(result_frame_name(i + 1)))
                .await
                .map_err(|e| {
                    JobError::MissingOutput(format!("failed to fetch {}: {e}", file.filename))
                })?;
        }
        Ok::<(), JobError>(())
    };
    tokio::time::timeout(fetch_timeout, fetch)
        .await
        .map_err(|_| {
            JobError::MissingOutput(format!(
                "fetching {} result frames did not finish within {}s",
                remote.len(),
                fetch_timeout.as_secs()
            ))
        })??;
    tracing::info!(frames = remote.len(), "Fetched result frames from inference server");
    Ok(remote.len())
}

fn is_plain_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}
