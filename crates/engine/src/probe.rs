//! Media metadata probing contract.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {tool} for {path}: {source}")]
    Exec {
        tool: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed (exit code {code}) for {path}: {stderr}")]
    Failed {
        tool: &'static str,
        path: PathBuf,
        code: i32,
        stderr: String,
    },
    #[error("unreadable probe output for {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Duration and thumbnail lookup for an input file.
///
/// Callers treat every error as "unknown": a failed duration probe means a
/// duration of 0, a failed thumbnail probe means no thumbnail.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Total media duration in milliseconds, 0 if the container does not say.
    async fn probe_duration_ms(&self, path: &Path) -> Result<u64, ProbeError>;

    /// Path of an image of the first frame, if thumbnails are enabled.
    async fn probe_thumbnail(&self, path: &Path) -> Result<Option<PathBuf>, ProbeError>;
}
