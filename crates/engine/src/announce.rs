//! "Make output visible" hook, fired once per completed job.

use log::info;
use std::path::Path;

pub trait OutputAnnouncer: Send + Sync {
    /// Fire-and-forget: implementations must not block and cannot fail the job.
    fn announce_output(&self, path: &Path, mime_type: &str);
}

/// Logs finished outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

impl OutputAnnouncer for LogAnnouncer {
    fn announce_output(&self, path: &Path, mime_type: &str) {
        info!("New output available: {} ({})", path.display(), mime_type);
    }
}

/// MIME type for an output container extension.
pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
