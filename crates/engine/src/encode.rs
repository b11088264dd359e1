//! Contract between the coordinator and an encoder implementation.
//!
//! An encoder turns one [`EncodeRequest`] into a stream of [`EncodeEvent`]s:
//! zero or more elapsed-time samples followed by exactly one terminal event.
//! The stream is a bounded channel consumed by the worker that owns the job.

use crate::config::EncoderConfig;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of a session's event channel.
pub const EVENT_BUFFER: usize = 64;

/// Fixed construction parameters shared by every job of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    /// ffmpeg encoder name, e.g. `libx265`.
    pub video_codec: String,
    pub preset: String,
    /// Constant rate factor (quality level).
    pub crf: u8,
    /// Decode-friendliness hint passed as `-tune`.
    pub tune: Option<String>,
    /// Encoder thread budget for one job.
    pub threads: usize,
}

impl EncodeParams {
    /// Build parameters from config. `workers` is the number of jobs that may
    /// encode at once and feeds the thread budget when none is configured.
    pub fn from_config(cfg: &EncoderConfig, workers: usize) -> Self {
        let threads = cfg
            .encoder_threads
            .unwrap_or_else(|| thread_budget(num_cpus::get(), workers));
        Self {
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            crf: cfg.crf,
            tune: cfg.tune.clone(),
            threads: threads.max(1),
        }
    }
}

/// Threads per job: half the host's parallelism, split across concurrent
/// jobs, never less than one.
pub fn thread_budget(parallelism: usize, workers: usize) -> usize {
    (parallelism / 2 / workers.max(1)).max(1)
}

/// Everything an encoder needs for one attempt.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Coordinator-assigned session number, for log correlation.
    pub session: u64,
    pub input: PathBuf,
    pub output: PathBuf,
    pub params: EncodeParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeEvent {
    /// Elapsed time of the current pass, in milliseconds.
    Sample(u64),
    Terminal(EncodeOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Success,
    Failure(FailureCause),
}

/// Why an encode attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Encoder exited abnormally. `detail` is the tail of its diagnostics.
    Exit { code: Option<i32>, detail: String },
    Cancelled,
    TimedOut { after_secs: u64 },
    /// The session broke down (I/O error, lost process, no terminal event).
    Crashed(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Exit { code: Some(code), .. } => write!(f, "encoder exit code {}", code),
            FailureCause::Exit { code: None, .. } => write!(f, "encoder terminated by signal"),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureCause::Crashed(reason) => write!(f, "encoder crashed: {}", reason),
        }
    }
}

/// The encoder could not be started at all.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder for {input}: {source}")]
    Spawn {
        input: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder setup failed: {0}")]
    Setup(String),
}

/// An encoder capability.
///
/// `start` must return promptly; the encode itself runs on a task the
/// implementation spawns. The implementation must emit exactly one
/// [`EncodeEvent::Terminal`] and should abort with
/// [`FailureCause::Cancelled`] once `cancel` fires.
pub trait Encoder: Send + Sync {
    fn start(
        &self,
        request: EncodeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EncodeEvent>, EncodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_budget() {
        assert_eq!(thread_budget(16, 1), 8);
        assert_eq!(thread_budget(16, 4), 2);
        assert_eq!(thread_budget(16, 16), 1);
        assert_eq!(thread_budget(1, 1), 1);
        assert_eq!(thread_budget(8, 0), 4);
    }

    #[test]
    fn test_params_from_config() {
        let cfg = EncoderConfig {
            encoder_threads: Some(3),
            ..Default::default()
        };
        let params = EncodeParams::from_config(&cfg, 2);
        assert_eq!(params.video_codec, "libx265");
        assert_eq!(params.preset, "faster");
        assert_eq!(params.crf, 23);
        assert_eq!(params.tune.as_deref(), Some("fastdecode"));
        assert_eq!(params.threads, 3);

        let derived = EncodeParams::from_config(&EncoderConfig::default(), 1);
        assert!(derived.threads >= 1);
    }

    #[test]
    fn test_failure_cause_display() {
        assert_eq!(
            FailureCause::Exit { code: Some(1), detail: String::new() }.to_string(),
            "encoder exit code 1"
        );
        assert_eq!(FailureCause::Cancelled.to_string(), "cancelled");
        assert_eq!(
            FailureCause::TimedOut { after_secs: 30 }.to_string(),
            "timed out after 30s"
        );
    }
}
