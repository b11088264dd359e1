use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use log::debug;
use crate::config::EncoderConfig;
use crate::probe::{MediaProbe, ProbeError};

/// Subset of ffprobe's JSON output that the engine reads
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    /// Seconds, as a decimal string ("12.480000")
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub duration: Option<String>,
}

impl FFProbeData {
    /// Container duration in milliseconds, falling back to the longest
    /// stream. 0 when neither is reported.
    pub fn duration_ms(&self) -> u64 {
        self.format
            .duration
            .as_deref()
            .and_then(parse_seconds_to_ms)
            .or_else(|| {
                self.streams
                    .iter()
                    .filter_map(|s| s.duration.as_deref().and_then(parse_seconds_to_ms))
                    .max()
            })
            .unwrap_or(0)
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.codec_type.as_deref() == Some("video"))
    }
}

/// "12.480000" -> 12480. Rejects negatives, NaN and "N/A".
fn parse_seconds_to_ms(value: &str) -> Option<u64> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0).round() as u64)
}

/// Probe backed by the ffprobe and ffmpeg binaries
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    thumbnail_dir: Option<PathBuf>,
}

impl FfprobeProbe {
    pub fn new(cfg: &EncoderConfig) -> Self {
        Self {
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            thumbnail_dir: cfg.thumbnail_dir.clone(),
        }
    }

    /// Run ffprobe and parse its JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData, ProbeError> {
        debug!("ffprobe: probing {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .output()
            .await
            .map_err(|source| ProbeError::Exec {
                tool: "ffprobe",
                path: file_path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                tool: "ffprobe",
                path: file_path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Parse {
            path: file_path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn thumbnail_path(dir: &Path, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        dir.join(format!("{}_thumb.jpg", stem))
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe_duration_ms(&self, path: &Path) -> Result<u64, ProbeError> {
        let data = self.probe_file(path).await?;
        if !data.has_video() {
            debug!("ffprobe: no video stream in {}", path.display());
        }
        Ok(data.duration_ms())
    }

    async fn probe_thumbnail(&self, path: &Path) -> Result<Option<PathBuf>, ProbeError> {
        let Some(dir) = &self.thumbnail_dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await.map_err(|source| ProbeError::Exec {
            tool: "ffmpeg",
            path: dir.clone(),
            source,
        })?;

        let thumb = Self::thumbnail_path(dir, path);
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-v")
            .arg("error")
            .arg("-nostdin")
            .arg("-y")
            .arg("-ss")
            .arg("0")
            .arg("-i")
            .arg(path)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg("scale=320:-2")
            .arg(&thumb)
            .output()
            .await
            .map_err(|source| ProbeError::Exec {
                tool: "ffmpeg",
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                tool: "ffmpeg",
                path: path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Some(thumb))
    }
}
