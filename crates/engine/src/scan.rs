use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Media file extensions picked up when a directory is given as input
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// Result of expanding one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// Path to submit. Not checked here; resolution happens at submission.
    Input(PathBuf),
    /// File found under a directory but not worth encoding (path, reason)
    Skipped(PathBuf, String),
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| MEDIA_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Is this file an output we produced earlier?
fn is_previous_output(path: &Path, output_suffix: &str) -> bool {
    !output_suffix.is_empty()
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.ends_with(output_suffix))
            .unwrap_or(false)
}

/// Expand directories into the media files below them, in path order.
///
/// Anything that is not a directory is passed through untouched so that
/// bad paths are reported by submission like any other input.
pub fn expand_inputs(paths: &[PathBuf], output_suffix: &str) -> Vec<ScanResult> {
    let mut results = Vec::new();

    for root in paths {
        if !root.is_dir() {
            results.push(ScanResult::Input(root.clone()));
            continue;
        }

        info!("Scanning directory: {}", root.display());
        let mut found = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !has_media_extension(path) {
                continue;
            }

            if is_previous_output(path, output_suffix) {
                debug!("Skipping earlier output: {}", path.display());
                found.push(ScanResult::Skipped(
                    path.to_path_buf(),
                    format!("already an output ({} suffix)", output_suffix),
                ));
                continue;
            }

            found.push(ScanResult::Input(path.to_path_buf()));
        }

        info!("Finished scanning {}: {} media files", root.display(), found.len());
        results.extend(found);
    }

    results
}
