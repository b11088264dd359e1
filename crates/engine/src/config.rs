use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the transcoding engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// ffmpeg video encoder name
    pub video_codec: String,
    /// Encoder speed preset
    pub preset: String,
    /// Constant rate factor (lower = higher quality, larger file)
    pub crf: u8,
    /// Tuning hint; `fastdecode` keeps the output cheap to play back
    pub tune: Option<String>,
    /// Appended to the input stem to form the output name
    pub output_suffix: String,
    /// Output container extension
    pub output_extension: String,
    /// Concurrent encodes (None = one per available CPU)
    pub workers: Option<usize>,
    /// Encoder threads per job (None = derived from CPUs and workers)
    pub encoder_threads: Option<usize>,
    /// Cancel an encode that runs longer than this
    pub encode_timeout_secs: Option<u64>,
    /// Where first-frame thumbnails go (None = no thumbnails)
    pub thumbnail_dir: Option<PathBuf>,
    /// Write a `.why.txt` next to the output when a job fails
    pub write_failure_notes: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EncoderConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            video_codec: "libx265".to_string(),
            preset: "faster".to_string(),
            crf: 23,
            tune: Some("fastdecode".to_string()),
            output_suffix: "_x265".to_string(),
            output_extension: "mp4".to_string(),
            workers: None,
            encoder_threads: None,
            encode_timeout_secs: None,
            thumbnail_dir: None,
            write_failure_notes: false,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = path else {
            return Ok(Self::default_config());
        };
        if !config_path.exists() {
            log::warn!("Config file {} not found, using defaults", config_path.display());
            return Ok(Self::default_config());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))
        }
    }

    /// Number of concurrent encodes
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path_gives_defaults() {
        assert_eq!(EncoderConfig::load_config(None).unwrap(), EncoderConfig::default());
        let cfg = EncoderConfig::load_config(Some(Path::new("/nonexistent/hevcq.toml"))).unwrap();
        assert_eq!(cfg, EncoderConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hevcq.toml");
        fs::write(&path, "crf = 28\nworkers = 2\nthumbnail_dir = \"/tmp/thumbs\"\n").unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.crf, 28);
        assert_eq!(cfg.worker_count(), 2);
        assert_eq!(cfg.thumbnail_dir, Some(PathBuf::from("/tmp/thumbs")));
        assert_eq!(cfg.video_codec, "libx265");
        assert_eq!(cfg.output_suffix, "_x265");
    }

    #[test]
    fn test_json_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hevcq.json");
        fs::write(&path, r#"{"preset": "slow", "encode_timeout_secs": 600}"#).unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.preset, "slow");
        assert_eq!(cfg.encode_timeout_secs, Some(600));
        assert!(!cfg.write_failure_notes);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hevcq.toml");
        fs::write(&path, "crf = \"high\"").unwrap();

        let err = EncoderConfig::load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse TOML config"));
    }

    #[test]
    fn test_worker_count_is_at_least_one() {
        let cfg = EncoderConfig { workers: Some(0), ..Default::default() };
        assert_eq!(cfg.worker_count(), 1);
    }
}
