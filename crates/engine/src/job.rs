//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Opaque, never-reused job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and queued, no encoder running yet.
    #[default]
    Pending,
    /// A worker is driving the encoder.
    Encoding,
    /// Encoder finished successfully.
    Completed,
    /// Encoder failed, was cancelled, or timed out.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed edges: `Pending -> Encoding -> {Completed, Failed}`, plus
    /// `Pending -> Failed` for a job cancelled while still queued.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Encoding)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Encoding, JobStatus::Completed)
                | (JobStatus::Encoding, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
    #[error("progress can only change while encoding (status is {0})")]
    NotEncoding(JobStatus),
    #[error("progress cannot go backwards ({current} -> {attempted})")]
    ProgressRegression { current: u8, attempted: u8 },
}

/// One transcode request and its observable state.
///
/// Identity and paths are fixed at construction; status and progress only
/// change through the checked transition methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    input_path: PathBuf,
    output_path: PathBuf,
    file_name: String,
    duration_ms: u64,
    thumbnail: Option<PathBuf>,
    status: JobStatus,
    progress: u8,
    encoder_session: Option<u64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

impl Job {
    /// New `Pending` job with zero progress. The display name is the input's
    /// file name.
    pub fn new(input_path: PathBuf, output_path: PathBuf, duration_ms: u64) -> Self {
        let file_name = input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input_path.display().to_string());

        Self {
            id: JobId::new(),
            input_path,
            output_path,
            file_name,
            duration_ms,
            thumbnail: None,
            status: JobStatus::Pending,
            progress: 0,
            encoder_session: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<PathBuf>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn thumbnail(&self) -> Option<&Path> {
        self.thumbnail.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn encoder_session(&self) -> Option<u64> {
        self.encoder_session
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Encoding)
    }

    /// Move to `next`, rejecting edges outside the state machine.
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            JobStatus::Encoding => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => self.finished_at = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        Ok(())
    }

    /// Set progress while encoding. Values must stay within 0..=100 and may
    /// not decrease.
    pub fn set_progress(&mut self, value: u8) -> Result<(), JobError> {
        if value > 100 {
            return Err(JobError::ProgressOutOfRange(value));
        }
        if self.status != JobStatus::Encoding {
            return Err(JobError::NotEncoding(self.status));
        }
        if value < self.progress {
            return Err(JobError::ProgressRegression {
                current: self.progress,
                attempted: value,
            });
        }
        self.progress = value;
        Ok(())
    }

    /// Claim the job for an encode attempt.
    pub fn begin_encoding(&mut self, session: u64) -> Result<(), JobError> {
        self.set_status(JobStatus::Encoding)?;
        self.encoder_session = Some(session);
        Ok(())
    }

    /// Successful finish: progress is pinned to 100.
    pub fn complete(&mut self) -> Result<(), JobError> {
        self.set_status(JobStatus::Completed)?;
        self.progress = 100;
        Ok(())
    }

    /// Mark the job as failed with a reason. Progress is left as it was.
    pub fn fail(&mut self, reason: &str) -> Result<(), JobError> {
        self.set_status(JobStatus::Failed)?;
        self.failure_reason = Some(reason.to_string());
        Ok(())
    }
}
