use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;

/// Get the path to the why.txt file for a job's output
pub fn why_txt_path(output_path: &Path) -> PathBuf {
    let mut path = output_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a job failed
pub fn write_why_txt(output_path: &Path, reason: &str) -> Result<PathBuf> {
    let why_path = why_txt_path(output_path);
    fs::write(&why_path, format!("{}\n", reason))
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(why_path)
}

/// Remove a stale why.txt left by an earlier failed run of the same input
pub fn clear_why_txt(output_path: &Path) -> Result<bool> {
    let why_path = why_txt_path(output_path);
    if !why_path.exists() {
        return Ok(false);
    }
    fs::remove_file(&why_path)
        .with_context(|| format!("Failed to remove why.txt: {}", why_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_why_txt_path() {
        assert_eq!(
            why_txt_path(Path::new("/v/clip_x265.mp4")),
            PathBuf::from("/v/clip_x265.why.txt")
        );
    }

    #[test]
    fn test_write_and_clear() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("clip_x265.mp4");

        let written = write_why_txt(&output, "encoder exit code 1").unwrap();
        assert_eq!(fs::read_to_string(&written).unwrap(), "encoder exit code 1\n");

        assert!(clear_why_txt(&output).unwrap());
        assert!(!written.exists());
        assert!(!clear_why_txt(&output).unwrap());
    }
}
