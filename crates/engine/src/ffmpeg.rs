//! ffmpeg-backed [`Encoder`].
//!
//! Each session spawns one ffmpeg process with `-progress pipe:1`, turns its
//! `out_time_us=` lines into samples, and keeps the tail of stderr so a
//! failed encode can say why.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::config::EncoderConfig;
use crate::encode::{
    EncodeError, EncodeEvent, EncodeOutcome, EncodeParams, EncodeRequest, Encoder, FailureCause,
    EVENT_BUFFER,
};

/// Oldest ffmpeg that reports `out_time_us` in `-progress` output.
pub const MIN_FFMPEG_MAJOR: u32 = 5;

/// Lines of stderr kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// FFmpeg version information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    pub fn meets_requirement(&self) -> bool {
        self.major >= MIN_FFMPEG_MAJOR
    }

    /// Parse the first line of `ffmpeg -version`.
    ///
    /// "ffmpeg version 6.1.1-3ubuntu5 Copyright ..." -> 6.1.1. Distribution
    /// suffixes after the numeric part are ignored; git builds ("N-11234-g...")
    /// have no release number and are rejected.
    pub fn parse(version_line: &str) -> Result<Self> {
        let token = version_line
            .split_whitespace()
            .skip_while(|t| *t != "version")
            .nth(1)
            .ok_or_else(|| anyhow!("No version number found in: {}", version_line))?;

        let numeric: String = token
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if numeric.is_empty() {
            bail!("Unrecognised ffmpeg version: {}", token);
        }

        let mut parts = numeric.split('.').filter(|p| !p.is_empty()).map(|p| {
            p.parse::<u32>()
                .with_context(|| format!("Bad version component '{}' in {}", p, token))
        });
        let major = parts.next().transpose()?.unwrap_or(0);
        let minor = parts.next().transpose()?.unwrap_or(0);
        let patch = parts.next().transpose()?.unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Does `ffmpeg -encoders` output list an encoder called `name`?
pub fn encoder_listed(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|encoder| encoder == name)
}

/// Arguments for one encode, input and output included.
pub fn build_encode_args(params: &EncodeParams, input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-nostdin",
        "-nostats",
        "-loglevel",
        "error",
        "-progress",
        "pipe:1",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(input.to_string_lossy().into_owned());

    args.push("-c:v".to_string());
    args.push(params.video_codec.clone());
    args.push("-preset".to_string());
    args.push(params.preset.clone());
    args.push("-crf".to_string());
    args.push(params.crf.to_string());
    if let Some(tune) = &params.tune {
        args.push("-tune".to_string());
        args.push(tune.clone());
    }
    args.push("-threads".to_string());
    args.push(params.threads.to_string());

    // QuickTime and most galleries only play HEVC in MP4 with the hvc1 tag.
    let is_hevc = params.video_codec.contains("265") || params.video_codec.contains("hevc");
    if is_hevc && output.extension().and_then(|e| e.to_str()) == Some("mp4") {
        args.push("-tag:v".to_string());
        args.push("hvc1".to_string());
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// Elapsed time in milliseconds from one `-progress` line, if it carries one.
///
/// Only `out_time_us` is read; ffmpeg also prints `out_time_ms`, which despite
/// the name is microseconds too, and `out_time`, both of which repeat it.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let value = line.trim().strip_prefix("out_time_us=")?;
    let micros = value.trim().parse::<i64>().ok()?;
    u64::try_from(micros).ok().map(|us| us / 1000)
}

/// Encoder that runs the ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
    version: Option<FFmpegVersion>,
}

impl FfmpegEncoder {
    /// Validate the ffmpeg binary and check that `cfg.video_codec` is
    /// available before any job is started.
    pub async fn new(cfg: &EncoderConfig) -> Result<Self> {
        let version = Self::detect_version(&cfg.ffmpeg_bin).await?;
        if !version.meets_requirement() {
            bail!(
                "ffmpeg {}.{}.{} is too old (need >= {}.0)",
                version.major,
                version.minor,
                version.patch,
                MIN_FFMPEG_MAJOR
            );
        }

        let output = Command::new(&cfg.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .with_context(|| format!("Failed to query encoders of {}", cfg.ffmpeg_bin.display()))?;
        let listing = String::from_utf8_lossy(&output.stdout);
        if !encoder_listed(&listing, &cfg.video_codec) {
            bail!(
                "ffmpeg at {} has no '{}' encoder; install a build with it enabled",
                cfg.ffmpeg_bin.display(),
                cfg.video_codec
            );
        }

        info!(
            "Using ffmpeg {}.{}.{} at {} with encoder {}",
            version.major,
            version.minor,
            version.patch,
            cfg.ffmpeg_bin.display(),
            cfg.video_codec
        );

        Ok(Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            version: Some(version),
        })
    }

    /// Skip the startup checks. Spawn errors surface per job instead.
    pub fn unchecked(cfg: &EncoderConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            version: None,
        }
    }

    pub fn version(&self) -> Option<FFmpegVersion> {
        self.version
    }

    async fn detect_version(ffmpeg_bin: &Path) -> Result<FFmpegVersion> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute ffmpeg at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            bail!("ffmpeg -version exited with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from ffmpeg -version"))?;
        FFmpegVersion::parse(first_line)
    }
}

impl Encoder for FfmpegEncoder {
    fn start(
        &self,
        request: EncodeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EncodeEvent>, EncodeError> {
        let args = build_encode_args(&request.params, &request.input, &request.output);
        debug!(
            "Session {}: {} {}",
            request.session,
            self.ffmpeg_bin.display(),
            args.join(" ")
        );

        let child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                input: request.input.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(drive_session(child, request.session, tx, cancel));
        Ok(rx)
    }
}

enum SessionEnd {
    Exited(ExitStatus),
    Cancelled,
    Broken(String),
    ReceiverGone,
}

/// Pump progress lines into `tx` until ffmpeg exits or the session is
/// cancelled, then send the terminal event.
async fn drive_session(
    mut child: Child,
    session: u64,
    tx: mpsc::Sender<EncodeEvent>,
    cancel: CancellationToken,
) {
    let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));

    let end = match child.stdout.take() {
        Some(stdout) => pump_progress(&mut child, stdout, &tx, &cancel).await,
        None => SessionEnd::Broken("ffmpeg stdout was not captured".to_string()),
    };

    if !matches!(end, SessionEnd::Exited(_)) {
        if let Err(e) = child.kill().await {
            warn!("Session {}: failed to kill ffmpeg: {}", session, e);
        }
    }

    let detail = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    let outcome = match end {
        SessionEnd::Exited(status) if status.success() => EncodeOutcome::Success,
        SessionEnd::Exited(status) => {
            debug!("Session {}: ffmpeg stderr:\n{}", session, detail);
            EncodeOutcome::Failure(FailureCause::Exit {
                code: status.code(),
                detail,
            })
        }
        SessionEnd::Cancelled => EncodeOutcome::Failure(FailureCause::Cancelled),
        SessionEnd::Broken(reason) => EncodeOutcome::Failure(FailureCause::Crashed(reason)),
        SessionEnd::ReceiverGone => {
            debug!("Session {}: consumer went away, ffmpeg killed", session);
            return;
        }
    };

    // The worker may already be gone (runtime shutdown); nothing to report to.
    let _ = tx.send(EncodeEvent::Terminal(outcome)).await;
}

async fn pump_progress<R>(
    child: &mut Child,
    stdout: R,
    tx: &mpsc::Sender<EncodeEvent>,
    cancel: &CancellationToken,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(ms) = parse_progress_line(&line) {
                        if tx.send(EncodeEvent::Sample(ms)).await.is_err() {
                            return SessionEnd::ReceiverGone;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return SessionEnd::Broken(format!("reading progress: {}", e)),
            },
        }
    }

    // stdout closed: ffmpeg is exiting.
    tokio::select! {
        biased;
        _ = cancel.cancelled() => SessionEnd::Cancelled,
        status = child.wait() => match status {
            Ok(status) => SessionEnd::Exited(status),
            Err(e) => SessionEnd::Broken(format!("waiting for ffmpeg: {}", e)),
        },
    }
}

async fn collect_tail<R>(stream: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}
