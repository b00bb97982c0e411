//! Input resolution: turn each [`InputDescriptor`] into a local file.
//!
//! Remote URLs are streamed to disk chunk by chunk, inline payloads are
//! base64-decoded (an optional `data:` URI prefix is stripped), and
//! pre-staged paths are copied from a configured root they may not
//! escape.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::JobError;
use crate::job::InputDescriptor;

#[derive(Debug, Clone)]
pub struct InputStager {
    http: reqwest::Client,
    download_timeout: Duration,
    staged_root: Option<PathBuf>,
}

impl InputStager {
    pub fn new(download_timeout: Duration, staged_root: Option<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            download_timeout,
            staged_root,
        }
    }

    /// Materialise `descriptor` at `dest`, returning the bytes written.
    ///
    /// `name` identifies the input in errors (`video`, `reference_image`).
    pub async fn stage(
        &self,
        name: &'static str,
        descriptor: &InputDescriptor,
        dest: &Path,
    ) -> Result<u64, JobError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::input(name, format!("cannot create {}: {e}", parent.display())))?;
        }

        let written = match descriptor {
            InputDescriptor::Url(url) => self.download(name, url, dest).await?,
            InputDescriptor::Base64(payload) => decode_inline(name, payload, dest).await?,
            InputDescriptor::Path(rel) => self.copy_staged(name, rel, dest).await?,
        };

        if written == 0 {
            return Err(JobError::input(name, "input is empty"));
        }

        tracing::info!(
            input = name,
            kind = descriptor.kind(),
            bytes = written,
            dest = %dest.display(),
            "Input staged"
        );
        Ok(written)
    }

    async fn download(&self, name: &'static str, url: &str, dest: &Path) -> Result<u64, JobError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| JobError::input(name, format!("invalid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(JobError::input(
                name,
                format!("unsupported URL scheme '{}'", parsed.scheme()),
            ));
        }

        let fetch = async {
            let response = self
                .http
                .get(parsed)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| JobError::input(name, format!("download failed: {e}")))?;

            let mut out = tokio::fs::File::create(dest)
                .await
                .map_err(|e| JobError::input(name, format!("cannot create {}: {e}", dest.display())))?;

            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| JobError::input(name, format!("download interrupted: {e}")))?;
                out.write_all(&chunk)
                    .await
                    .map_err(|e| JobError::input(name, format!("write failed: {e}")))?;
                written += chunk.len() as u64;
            }
            out.flush()
                .await
                .map_err(|e| JobError::input(name, format!("write failed: {e}")))?;
            Ok::<u64, JobError>(written)
        };

        tokio::time::timeout(self.download_timeout, fetch)
            .await
            .map_err(|_| {
                JobError::input(
                    name,
                    format!("download did not finish within {}s", self.download_timeout.as_secs()),
                )
            })?
    }

    async fn copy_staged(&self, name: &'static str, rel: &str, dest: &Path) -> Result<u64, JobError> {
        let root = self
            .staged_root
            .as_deref()
            .ok_or_else(|| JobError::input(name, "pre-staged inputs are not enabled"))?;
        let source = confine(root, rel).map_err(|reason| JobError::input(name, reason))?;

        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| JobError::input(name, format!("{rel}: {e}")))?;
        if !meta.is_file() {
            return Err(JobError::input(name, format!("{rel} is not a regular file")));
        }

        tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| JobError::input(name, format!("copy failed: {e}")))
    }
}

async fn decode_inline(name: &'static str, payload: &str, dest: &Path) -> Result<u64, JobError> {
    let bytes = decode_base64_payload(payload).map_err(|reason| JobError::input(name, reason))?;
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| JobError::input(name, format!("write failed: {e}")))?;
    Ok(bytes.len() as u64)
}

/// Decode a base64 payload, accepting a `data:<mime>;base64,` prefix and
/// embedded whitespace.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, String> {
    let data = match payload.strip_prefix("data:") {
        Some(uri) => match uri.split_once(',') {
            Some((_, data)) => data,
            None => return Err("data URI has no payload".to_string()),
        },
        None => payload,
    };

    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| format!("invalid base64: {e}"))
}

/// Resolve `rel` under `root`, rejecting absolute paths and `..`.
pub fn confine(root: &Path, rel: &str) -> Result<PathBuf, String> {
    let rel_path = Path::new(rel);
    if rel.is_empty() {
        return Err("empty path".to_string());
    }

    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(format!("'{rel}' escapes the staging directory")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{rel}' must be relative to the staging directory"))
            }
        }
    }

    Ok(root.join(rel_path))
}
