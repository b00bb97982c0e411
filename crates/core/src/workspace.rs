//! Job-scoped workspace directories.
//!
//! [`WorkspaceManager`] owns the input, output and temp directories a
//! job writes into. [`WorkspaceManager::reset`] empties them before a job
//! starts and [`WorkspaceManager::lease`] hands out a [`WorkspaceLease`]
//! guard that empties them again when dropped, on every exit path.
//!
//! All operations are plain filesystem calls, so cleanup is safe even if
//! a remote call made during the job is still nominally in flight.

use std::io;
use std::path::{Path, PathBuf};

/// The three job-scoped directories.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    /// Where the inference server reads its inputs from.
    pub input_dir: PathBuf,
    /// Where the inference server writes result artifacts.
    pub output_dir: PathBuf,
    /// Scratch space for downloads, demuxed audio and encodes.
    pub temp_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn dirs(&self) -> [&Path; 3] {
        [
            self.input_dir.as_path(),
            self.output_dir.as_path(),
            self.temp_dir.as_path(),
        ]
    }
}

/// A filesystem operation on a workspace directory failed.
#[derive(Debug, thiserror::Error)]
#[error("workspace operation on {path} failed: {source}")]
pub struct WorkspaceError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    layout: WorkspaceLayout,
}

impl WorkspaceManager {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Empty every job-scoped directory, creating any that are missing.
    ///
    /// The directories themselves are kept (they may be mount points or
    /// paths the inference server holds open); only their entries are
    /// removed. Calling this twice leaves the same empty state as once.
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        for dir in self.layout.dirs() {
            clear_dir(dir)?;
        }
        Ok(())
    }

    /// Same reset-to-empty operation, invoked when a job ends.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        self.reset()
    }

    /// Reset the workspace and return a guard that cleans it up on drop.
    pub fn lease(&self) -> Result<WorkspaceLease<'_>, WorkspaceError> {
        self.reset()?;
        Ok(WorkspaceLease { manager: self })
    }

    /// Total number of entries across all job-scoped directories.
    pub fn entry_count(&self) -> Result<usize, WorkspaceError> {
        let mut total = 0;
        for dir in self.layout.dirs() {
            match std::fs::read_dir(dir) {
                Ok(entries) => total += entries.count(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(WorkspaceError {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            }
        }
        Ok(total)
    }
}

/// Scoped acquisition of the workspace for one job.
///
/// Dropping the lease empties every job-scoped directory. Failures are
/// logged; there is no caller left to return them to.
pub struct WorkspaceLease<'a> {
    manager: &'a WorkspaceManager,
}

impl WorkspaceLease<'_> {
    pub fn layout(&self) -> &WorkspaceLayout {
        self.manager.layout()
    }
}

impl Drop for WorkspaceLease<'_> {
    fn drop(&mut self) {
        match self.manager.cleanup() {
            Ok(()) => tracing::debug!("Workspace cleaned up"),
            Err(e) => tracing::error!(error = %e, "Workspace cleanup failed"),
        }
    }
}

/// Remove every entry of `dir`, creating it if it does not exist.
fn clear_dir(dir: &Path) -> Result<(), WorkspaceError> {
    let err = |source: io::Error| WorkspaceError {
        path: dir.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(err)?;

    for entry in std::fs::read_dir(dir).map_err(err)? {
        let entry = entry.map_err(err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|source| WorkspaceError {
            path: path.clone(),
            source,
        })?;

        // Symlinked directories are unlinked, never followed.
        let result = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };

        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(WorkspaceError { path, source }),
        }
    }
    Ok(())
}
