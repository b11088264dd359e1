//! Batch submission and concurrent encode driving.
//!
//! [`EncodingCoordinator::submit`] turns input paths into `Pending` jobs and
//! dispatches each to a task that waits for one of `workers` slots. A task
//! claims its job (`Pending -> Encoding`) under the store lock before it
//! touches the encoder, so a job can never be encoded twice at once.

use crate::announce::{mime_for_extension, LogAnnouncer, OutputAnnouncer};
use crate::config::EncoderConfig;
use crate::encode::{
    EncodeEvent, EncodeOutcome, EncodeParams, EncodeRequest, Encoder, FailureCause,
};
use crate::job::{Job, JobId, JobStatus};
use crate::probe::MediaProbe;
use crate::progress::ProgressTracker;
use crate::sidecar;
use crate::store::{ChangeKind, JobStore, StoreError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const NOTICE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot resolve {path}: {reason}")]
    PathResolution { path: PathBuf, reason: String },
    #[error("{0} is already queued or encoding")]
    AlreadyQueued(PathBuf),
    #[error("failed to remove previous output {path}: {source}")]
    OutputCleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Short user-facing message, distinct from the durable job status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Rejected { path: PathBuf, reason: String },
    Completed { id: JobId, file_name: String },
    Failed { id: JobId, file_name: String, reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Rejected { path, reason } => {
                write!(f, "Skipped {}: {}", path.display(), reason)
            }
            Notice::Completed { file_name, .. } => write!(f, "Encoding completed: {}", file_name),
            Notice::Failed { file_name, reason, .. } => {
                write!(f, "Encoding failed for {}: {}", file_name, reason)
            }
        }
    }
}

/// What a [`EncodingCoordinator::submit`] call did with each input.
#[derive(Debug, Default, Clone)]
pub struct SubmitReport {
    pub created: Vec<JobId>,
    pub rejected: Vec<(PathBuf, String)>,
}

/// `<dir>/<stem><suffix>.<extension>` next to the input.
pub fn derive_output_path(input: &Path, suffix: &str, extension: &str) -> Option<PathBuf> {
    let parent = input.parent()?;
    let stem = input.file_stem()?.to_string_lossy();
    Some(parent.join(format!("{}{}.{}", stem, suffix, extension)))
}

/// Canonical path of a readable regular file.
pub async fn resolve_input(path: &Path) -> Result<PathBuf, CoordinatorError> {
    let unresolved = |reason: String| CoordinatorError::PathResolution {
        path: path.to_path_buf(),
        reason,
    };

    let resolved = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| unresolved(e.to_string()))?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| unresolved(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unresolved("not a regular file".to_string()));
    }
    tokio::fs::File::open(&resolved)
        .await
        .map_err(|e| unresolved(format!("not readable: {}", e)))?;
    Ok(resolved)
}

struct Shared {
    store: Arc<JobStore>,
    encoder: Arc<dyn Encoder>,
    probe: Arc<dyn MediaProbe>,
    announcer: Arc<dyn OutputAnnouncer>,
    params: EncodeParams,
    workers: usize,
    slots: Arc<Semaphore>,
    output_suffix: String,
    output_extension: String,
    timeout: Option<Duration>,
    write_failure_notes: bool,
    notices: broadcast::Sender<Notice>,
    cancels: Mutex<HashMap<JobId, CancellationToken>>,
    /// Parent of every job token. Cancelled once by `cancel_all`.
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_session: AtomicU64,
}

/// Owns the job store and the bounded pool of encode slots. Cheap to clone;
/// clones share everything.
#[derive(Clone)]
pub struct EncodingCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for EncodingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingCoordinator")
            .field("workers", &self.shared.workers)
            .field("params", &self.shared.params)
            .field("store", &self.shared.store)
            .finish()
    }
}

impl EncodingCoordinator {
    pub fn new(cfg: &EncoderConfig, encoder: Arc<dyn Encoder>, probe: Arc<dyn MediaProbe>) -> Self {
        Self::with_announcer(cfg, encoder, probe, Arc::new(LogAnnouncer))
    }

    pub fn with_announcer(
        cfg: &EncoderConfig,
        encoder: Arc<dyn Encoder>,
        probe: Arc<dyn MediaProbe>,
        announcer: Arc<dyn OutputAnnouncer>,
    ) -> Self {
        let workers = cfg.worker_count();
        let params = EncodeParams::from_config(cfg, workers);
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        info!(
            "Coordinator ready: {} worker(s), {} preset {} crf {} with {} thread(s) per job",
            workers, params.video_codec, params.preset, params.crf, params.threads
        );

        Self {
            shared: Arc::new(Shared {
                store: Arc::new(JobStore::new()),
                encoder,
                probe,
                announcer,
                params,
                workers,
                slots: Arc::new(Semaphore::new(workers)),
                output_suffix: cfg.output_suffix.clone(),
                output_extension: cfg.output_extension.clone(),
                timeout: cfg.encode_timeout_secs.map(Duration::from_secs),
                write_failure_notes: cfg.write_failure_notes,
                notices,
                cancels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.shared.store
    }

    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    pub fn params(&self) -> &EncodeParams {
        &self.shared.params
    }

    /// Receive notices issued after this call.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    /// Create and dispatch a job for every input that resolves. Inputs that
    /// do not are reported (notice + report entry) and skipped; they never
    /// abort the rest of the batch. After [`cancel_all`](Self::cancel_all)
    /// every remaining input is reported as cancelled.
    pub async fn submit(&self, paths: &[PathBuf]) -> SubmitReport {
        let mut report = SubmitReport::default();

        for (i, path) in paths.iter().enumerate() {
            if self.shared.shutdown.is_cancelled() {
                info!("Submission cancelled, {} input(s) not queued", paths.len() - i);
                report.rejected.extend(
                    paths[i..]
                        .iter()
                        .map(|p| (p.clone(), CoordinatorError::Cancelled.to_string())),
                );
                break;
            }

            let created = match self.shared.prepare(path).await {
                Ok(_) if self.shared.shutdown.is_cancelled() => Err(CoordinatorError::Cancelled),
                Ok(job) => self.shared.store.append(job).map_err(CoordinatorError::from),
                Err(e) => Err(e),
            };

            match created {
                Ok(index) => {
                    let Some(job) = self.shared.store.job_at(index) else {
                        continue;
                    };
                    info!(
                        "Job {}: queued {} ({} ms)",
                        job.id(),
                        job.input_path().display(),
                        job.duration_ms()
                    );
                    if !self.dispatch(job.id()) {
                        // cancel_all raced with this append
                        self.shared.finish_cancelled_in_queue(job.id());
                    }
                    report.created.push(job.id());
                }
                Err(CoordinatorError::Cancelled) => {
                    report.rejected.push((path.clone(), CoordinatorError::Cancelled.to_string()));
                }
                Err(e) => {
                    warn!("Rejected input {}: {}", path.display(), e);
                    let reason = match &e {
                        CoordinatorError::PathResolution { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    self.shared.notify(Notice::Rejected {
                        path: path.clone(),
                        reason: reason.clone(),
                    });
                    report.rejected.push((path.clone(), reason));
                }
            }
        }

        report
    }

    /// Queue an encode task for a `Pending` job. Returns false when the job
    /// is unknown, no longer pending, or `cancel_all` has been called.
    /// Dispatching the same job twice is harmless: only the first task to
    /// claim it runs the encoder.
    pub fn dispatch(&self, id: JobId) -> bool {
        if self.shared.shutdown.is_cancelled() {
            debug!("Job {}: not dispatched, coordinator is shutting down", id);
            return false;
        }
        match self.shared.store.get(id) {
            Some(job) if job.status() == JobStatus::Pending => {}
            Some(job) => {
                debug!("Job {}: not dispatched, status is {}", id, job.status());
                return false;
            }
            None => {
                warn!("Job {}: not dispatched, unknown job", id);
                return false;
            }
        }

        let token = self
            .shared
            .cancels
            .lock()
            .entry(id)
            .or_insert_with(|| self.shared.shutdown.child_token())
            .clone();
        let shared = Arc::clone(&self.shared);
        self.shared.tasks.spawn(async move {
            shared.run_job(id, token).await;
        });
        true
    }

    /// Ask a queued or running job to stop. It ends up `Failed`.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.shared.cancels.lock().get(&id) {
            Some(token) => {
                info!("Job {}: cancellation requested", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop everything: queued and running jobs are cancelled, a `submit`
    /// in progress queues nothing more, and later dispatches are refused.
    /// Returns how many jobs were queued or running.
    pub fn cancel_all(&self) -> usize {
        let cancels = self.shared.cancels.lock();
        self.shared.shutdown.cancel();
        cancels.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Wait until every dispatched task has finished.
    pub async fn wait_idle(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.tasks.reopen();
    }
}

impl Shared {
    fn notify(&self, notice: Notice) {
        // No subscribers is fine; notices are transient.
        let _ = self.notices.send(notice);
    }

    async fn prepare(&self, path: &Path) -> Result<Job, CoordinatorError> {
        let input = resolve_input(path).await?;
        let output = derive_output_path(&input, &self.output_suffix, &self.output_extension)
            .filter(|output| *output != input)
            .ok_or_else(|| CoordinatorError::PathResolution {
                path: path.to_path_buf(),
                reason: "no usable output name".to_string(),
            })?;

        if self
            .store
            .any_job(|job| job.is_active() && job.output_path() == output)
        {
            return Err(CoordinatorError::AlreadyQueued(input));
        }

        match tokio::fs::remove_file(&output).await {
            Ok(()) => info!("Removed previous output {}", output.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(CoordinatorError::OutputCleanup { path: output, source }),
        }
        if self.write_failure_notes {
            if let Err(e) = sidecar::clear_why_txt(&output) {
                warn!("{:#}", e);
            }
        }

        let duration_ms = self.probe.probe_duration_ms(&input).await.unwrap_or_else(|e| {
            warn!("Duration unknown for {}: {}", input.display(), e);
            0
        });
        let thumbnail = self.probe.probe_thumbnail(&input).await.unwrap_or_else(|e| {
            debug!("No thumbnail for {}: {}", input.display(), e);
            None
        });

        Ok(Job::new(input, output, duration_ms).with_thumbnail(thumbnail))
    }

    async fn run_job(self: Arc<Self>, id: JobId, cancel: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.finish_cancelled_in_queue(id);
                return;
            }
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Job {}: worker pool closed", id);
                    return;
                }
            },
        };

        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let claimed = self.store.update(id, ChangeKind::Status, |job| {
            job.begin_encoding(session)?;
            Ok(job.clone())
        });
        let job = match claimed {
            Ok(job) => job,
            Err(e) => {
                debug!("Job {}: not started: {}", id, e);
                return;
            }
        };

        info!(
            "Job {}: encoding {} -> {} (session {})",
            id,
            job.input_path().display(),
            job.output_path().display(),
            session
        );

        let outcome = self.drive(&job, session, &cancel).await;
        self.cancels.lock().remove(&id);
        drop(permit);

        self.apply_outcome(&job, outcome).await;
    }

    /// Consume one encoder session, writing progress into the store.
    async fn drive(&self, job: &Job, session: u64, cancel: &CancellationToken) -> EncodeOutcome {
        let id = job.id();
        let request = EncodeRequest {
            session,
            input: job.input_path().to_path_buf(),
            output: job.output_path().to_path_buf(),
            params: self.params.clone(),
        };

        let mut events = match self.encoder.start(request, cancel.clone()) {
            Ok(events) => events,
            Err(e) => return EncodeOutcome::Failure(FailureCause::Crashed(e.to_string())),
        };

        let mut tracker = ProgressTracker::new();
        let mut last_percent = job.progress();
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;

        loop {
            let event = match deadline {
                Some(deadline) if !timed_out => tokio::select! {
                    event = events.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!("Job {}: timed out, cancelling encoder", id);
                        timed_out = true;
                        cancel.cancel();
                        continue;
                    }
                },
                _ => events.recv().await,
            };

            match event {
                Some(EncodeEvent::Sample(raw_ms)) => {
                    let Some(percent) = tracker.observe(raw_ms, job.duration_ms()) else {
                        continue;
                    };
                    if percent <= last_percent {
                        continue;
                    }
                    match self
                        .store
                        .update(id, ChangeKind::Progress, |j| j.set_progress(percent))
                    {
                        Ok(()) => last_percent = percent,
                        Err(e) => warn!("Job {}: progress {} not applied: {}", id, percent, e),
                    }
                }
                Some(EncodeEvent::Terminal(EncodeOutcome::Failure(FailureCause::Cancelled)))
                    if timed_out =>
                {
                    let after_secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                    return EncodeOutcome::Failure(FailureCause::TimedOut { after_secs });
                }
                Some(EncodeEvent::Terminal(outcome)) => return outcome,
                None => {
                    return EncodeOutcome::Failure(FailureCause::Crashed(
                        "session ended without a terminal event".to_string(),
                    ))
                }
            }
        }
    }

    async fn apply_outcome(&self, job: &Job, outcome: EncodeOutcome) {
        let id = job.id();
        match outcome {
            EncodeOutcome::Success => {
                if let Err(e) = self.store.update(id, ChangeKind::Both, |j| j.complete()) {
                    error!("Job {}: could not mark completed: {}", id, e);
                    return;
                }
                info!("Job {}: completed {}", id, job.output_path().display());
                let mime = mime_for_extension(&self.output_extension);
                self.announcer.announce_output(job.output_path(), mime);
                self.notify(Notice::Completed {
                    id,
                    file_name: job.file_name().to_string(),
                });
            }
            EncodeOutcome::Failure(cause) => {
                let reason = cause.to_string();
                error!("Job {}: failed: {}", id, reason);
                if let FailureCause::Exit { detail, .. } = &cause {
                    if !detail.is_empty() {
                        warn!("Job {}: encoder said:\n{}", id, detail);
                    }
                }

                if let Err(e) = self.store.update(id, ChangeKind::Status, |j| j.fail(&reason)) {
                    error!("Job {}: could not mark failed: {}", id, e);
                }

                // A half-written output is useless.
                match tokio::fs::remove_file(job.output_path()).await {
                    Ok(()) => debug!("Job {}: removed partial output", id),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Job {}: could not remove partial output: {}", id, e),
                }

                if self.write_failure_notes {
                    let note = match &cause {
                        FailureCause::Exit { detail, .. } if !detail.is_empty() => {
                            format!("{}\n\n{}", reason, detail)
                        }
                        _ => reason.clone(),
                    };
                    if let Err(e) = sidecar::write_why_txt(job.output_path(), &note) {
                        warn!("Job {}: {:#}", id, e);
                    }
                }

                self.notify(Notice::Failed {
                    id,
                    file_name: job.file_name().to_string(),
                    reason,
                });
            }
        }
    }

    fn finish_cancelled_in_queue(&self, id: JobId) {
        self.cancels.lock().remove(&id);
        match self.store.update(id, ChangeKind::Status, |j| {
            j.fail("cancelled")?;
            Ok(j.file_name().to_string())
        }) {
            Ok(file_name) => {
                info!("Job {}: cancelled before it started", id);
                self.notify(Notice::Failed {
                    id,
                    file_name,
                    reason: "cancelled".to_string(),
                });
            }
            Err(e) => debug!("Job {}: cancel while queued had no effect: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{EncodeError, EVENT_BUFFER};
    use crate::probe::ProbeError;
    use crate::store::JobObserver;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Replays a fixed event list for every session.
    struct ScriptedEncoder {
        script: Vec<EncodeEvent>,
        starts: AtomicUsize,
    }

    impl ScriptedEncoder {
        fn new(script: Vec<EncodeEvent>) -> Arc<Self> {
            Arc::new(Self {
                script,
                starts: AtomicUsize::new(0),
            })
        }
    }

    impl Encoder for ScriptedEncoder {
        fn start(
            &self,
            _request: EncodeRequest,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<EncodeEvent>, EncodeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let script = self.script.clone();
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Reports one sample, then runs until cancelled.
    #[derive(Default)]
    struct StallingEncoder {
        starts: AtomicUsize,
    }

    impl Encoder for StallingEncoder {
        fn start(
            &self,
            _request: EncodeRequest,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<EncodeEvent>, EncodeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(async move {
                let _ = tx.send(EncodeEvent::Sample(1000)).await;
                cancel.cancelled().await;
                let _ = tx
                    .send(EncodeEvent::Terminal(EncodeOutcome::Failure(FailureCause::Cancelled)))
                    .await;
            });
            Ok(rx)
        }
    }

    struct FixedProbe {
        duration_ms: Option<u64>,
    }

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn probe_duration_ms(&self, path: &Path) -> Result<u64, ProbeError> {
            self.duration_ms.ok_or_else(|| ProbeError::Parse {
                path: path.to_path_buf(),
                reason: "no format section".to_string(),
            })
        }

        async fn probe_thumbnail(&self, _path: &Path) -> Result<Option<PathBuf>, ProbeError> {
            Ok(None)
        }
    }

    /// Takes `delay` per duration lookup, like ffprobe on a slow disk.
    struct SlowProbe {
        delay: Duration,
    }

    #[async_trait]
    impl MediaProbe for SlowProbe {
        async fn probe_duration_ms(&self, _path: &Path) -> Result<u64, ProbeError> {
            tokio::time::sleep(self.delay).await;
            Ok(1000)
        }

        async fn probe_thumbnail(&self, _path: &Path) -> Result<Option<PathBuf>, ProbeError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingAnnouncer {
        announced: Mutex<Vec<(PathBuf, String)>>,
    }

    impl OutputAnnouncer for RecordingAnnouncer {
        fn announce_output(&self, path: &Path, mime_type: &str) {
            self.announced
                .lock()
                .push((path.to_path_buf(), mime_type.to_string()));
        }
    }

    /// Captures the job state seen at each change notification.
    struct Recorder {
        store: Weak<JobStore>,
        seen: Mutex<Vec<(ChangeKind, JobStatus, u8)>>,
    }

    impl Recorder {
        fn attach(store: &Arc<JobStore>) -> Arc<Self> {
            let recorder = Arc::new(Self {
                store: Arc::downgrade(store),
                seen: Mutex::new(Vec::new()),
            });
            store.subscribe(recorder.clone());
            recorder
        }

        fn progress_values(&self) -> Vec<u8> {
            self.seen
                .lock()
                .iter()
                .filter(|(kind, _, _)| *kind == ChangeKind::Progress)
                .map(|(_, _, progress)| *progress)
                .collect()
        }

        fn statuses(&self) -> Vec<JobStatus> {
            let mut statuses: Vec<JobStatus> = Vec::new();
            for (_, status, _) in self.seen.lock().iter() {
                if statuses.last() != Some(status) {
                    statuses.push(*status);
                }
            }
            statuses
        }
    }

    impl JobObserver for Recorder {
        fn on_job_inserted(&self, _index: usize) {}

        fn on_job_changed(&self, index: usize, kind: ChangeKind) {
            if let Some(job) = self.store.upgrade().and_then(|s| s.job_at(index)) {
                self.seen.lock().push((kind, job.status(), job.progress()));
            }
        }
    }

    fn config(workers: usize) -> EncoderConfig {
        EncoderConfig {
            workers: Some(workers),
            encoder_threads: Some(1),
            ..Default::default()
        }
    }

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"not really a video").unwrap();
        path
    }

    fn drain_notices(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    async fn wait_for_status(store: &JobStore, id: JobId, status: JobStatus) {
        for _ in 0..500 {
            if store.get(id).map(|j| j.status()) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    fn success_after(samples: &[u64]) -> Vec<EncodeEvent> {
        let mut script: Vec<_> = samples.iter().map(|ms| EncodeEvent::Sample(*ms)).collect();
        script.push(EncodeEvent::Terminal(EncodeOutcome::Success));
        script
    }

    #[test]
    fn test_derive_output_path() {
        assert_eq!(
            derive_output_path(Path::new("/v/trip.mov"), "_x265", "mp4"),
            Some(PathBuf::from("/v/trip_x265.mp4"))
        );
        assert_eq!(
            derive_output_path(Path::new("/v/archive.tar.mkv"), "_x265", "mp4"),
            Some(PathBuf::from("/v/archive.tar_x265.mp4"))
        );
        assert_eq!(derive_output_path(Path::new("/"), "_x265", "mp4"), None);
    }

    #[tokio::test]
    async fn test_resolve_input() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "clip.mov");

        let resolved = resolve_input(&file).await.unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("clip.mov"));

        let missing = resolve_input(&dir.path().join("gone.mov")).await;
        assert!(matches!(missing, Err(CoordinatorError::PathResolution { .. })));

        let not_file = resolve_input(dir.path()).await.unwrap_err();
        assert!(not_file.to_string().contains("not a regular file"));
    }

    #[tokio::test]
    async fn test_batch_with_unresolvable_input() {
        let dir = TempDir::new().unwrap();
        let good = touch(&dir, "good.mov");
        let missing = dir.path().join("missing.mov");

        let encoder = ScriptedEncoder::new(success_after(&[2500, 10000]));
        let coordinator = EncodingCoordinator::new(
            &config(2),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(10_000) }),
        );
        let recorder = Recorder::attach(coordinator.store());
        let mut notices = coordinator.subscribe_notices();

        let report = coordinator.submit(&[good, missing.clone()]).await;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, missing);

        coordinator.wait_idle().await;

        let store = coordinator.store();
        assert_eq!(store.len(), 1);
        let job = store.get(report.created[0]).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.duration_ms(), 10_000);
        assert_eq!(
            recorder.statuses(),
            vec![JobStatus::Encoding, JobStatus::Completed]
        );
        assert_eq!(encoder.starts.load(Ordering::SeqCst), 1);

        let notices = drain_notices(&mut notices);
        assert_eq!(notices.len(), 2);
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::Rejected { path, .. } if *path == missing)));
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::Completed { file_name, .. } if file_name == "good.mov")));
    }

    #[tokio::test]
    async fn test_progress_sequence_and_completion() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "beach.mov");
        let announcer = Arc::new(RecordingAnnouncer::default());
        let coordinator = EncodingCoordinator::with_announcer(
            &config(1),
            ScriptedEncoder::new(success_after(&[1000, 5000, 10000])),
            Arc::new(FixedProbe { duration_ms: Some(10_000) }),
            announcer.clone(),
        );
        let recorder = Recorder::attach(coordinator.store());

        let report = coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;

        assert_eq!(recorder.progress_values(), vec![10, 50, 100]);
        let job = coordinator.store().get(report.created[0]).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        assert_eq!(job.encoder_session(), Some(1));
        assert!(job.output_path().ends_with("beach_x265.mp4"));

        let last = *recorder.seen.lock().last().unwrap();
        assert_eq!(last, (ChangeKind::Both, JobStatus::Completed, 100));

        let announced = announcer.announced.lock().clone();
        assert_eq!(announced, vec![(job.output_path().to_path_buf(), "video/mp4".to_string())]);
    }

    #[tokio::test]
    async fn test_pass_reset_keeps_progress_monotonic() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "twopass.mov");
        let mut script: Vec<_> = [5000, 9000, 2000, 6000]
            .iter()
            .map(|ms| EncodeEvent::Sample(*ms))
            .collect();
        script.push(EncodeEvent::Terminal(EncodeOutcome::Failure(FailureCause::Exit {
            code: Some(1),
            detail: "Conversion failed!".to_string(),
        })));

        let coordinator = EncodingCoordinator::new(
            &config(1),
            ScriptedEncoder::new(script),
            Arc::new(FixedProbe { duration_ms: Some(20_000) }),
        );
        let recorder = Recorder::attach(coordinator.store());

        let report = coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;

        assert_eq!(recorder.progress_values(), vec![25, 45, 55, 75]);
        let job = coordinator.store().get(report.created[0]).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 75);
        assert_eq!(job.failure_reason(), Some("encoder exit code 1"));
    }

    #[tokio::test]
    async fn test_failure_without_samples() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "broken.mov");
        let cfg = EncoderConfig {
            write_failure_notes: true,
            ..config(1)
        };
        let coordinator = EncodingCoordinator::new(
            &cfg,
            ScriptedEncoder::new(vec![EncodeEvent::Terminal(EncodeOutcome::Failure(
                FailureCause::Crashed("segfault".to_string()),
            ))]),
            Arc::new(FixedProbe { duration_ms: Some(10_000) }),
        );
        let mut notices = coordinator.subscribe_notices();

        let report = coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;

        let job = coordinator.store().get(report.created[0]).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 0);
        assert!(job.finished_at().is_some());

        let note = std::fs::read_to_string(sidecar::why_txt_path(job.output_path())).unwrap();
        assert!(note.contains("segfault"));

        let notices = drain_notices(&mut notices);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].to_string().starts_with("Encoding failed for broken.mov"));
    }

    #[tokio::test]
    async fn test_unknown_duration_keeps_progress_inert() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "mystery.mov");
        let coordinator = EncodingCoordinator::new(
            &config(1),
            ScriptedEncoder::new(success_after(&[1000, 50_000])),
            Arc::new(FixedProbe { duration_ms: None }),
        );
        let recorder = Recorder::attach(coordinator.store());

        let report = coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;

        assert!(recorder.progress_values().is_empty());
        let job = coordinator.store().get(report.created[0]).unwrap();
        assert_eq!(job.duration_ms(), 0);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
    }

    #[tokio::test]
    async fn test_double_dispatch_runs_encoder_once() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "race.mov");
        let encoder = ScriptedEncoder::new(success_after(&[500]));
        let coordinator = EncodingCoordinator::new(
            &config(4),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(1000) }),
        );

        let report = coordinator.submit(&[input]).await;
        let id = report.created[0];
        coordinator.dispatch(id);
        coordinator.dispatch(id);
        coordinator.wait_idle().await;

        assert_eq!(encoder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().get(id).unwrap().status(), JobStatus::Completed);
        assert!(!coordinator.dispatch(id));
        assert!(!coordinator.dispatch(JobId::new()));
    }

    #[tokio::test]
    async fn test_existing_output_is_replaced() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "old.mov");
        let stale = touch(&dir, "old_x265.mp4");
        let coordinator = EncodingCoordinator::new(
            &config(1),
            ScriptedEncoder::new(success_after(&[])),
            Arc::new(FixedProbe { duration_ms: Some(1000) }),
        );

        coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "long.mov");
        let encoder = Arc::new(StallingEncoder::default());
        let coordinator = EncodingCoordinator::new(
            &config(1),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(4000) }),
        );

        let id = coordinator.submit(&[input]).await.created[0];
        wait_for_status(coordinator.store(), id, JobStatus::Encoding).await;

        assert!(coordinator.cancel(id));
        coordinator.wait_idle().await;

        let job = coordinator.store().get(id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.failure_reason(), Some("cancelled"));
        assert!(!coordinator.cancel(id));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_starts_encoder() {
        let dir = TempDir::new().unwrap();
        let first = touch(&dir, "first.mov");
        let second = touch(&dir, "second.mov");
        let encoder = Arc::new(StallingEncoder::default());
        let coordinator = EncodingCoordinator::new(
            &config(1),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(4000) }),
        );

        let report = coordinator.submit(&[first, second]).await;
        let (running, queued) = (report.created[0], report.created[1]);
        wait_for_status(coordinator.store(), running, JobStatus::Encoding).await;
        assert_eq!(
            coordinator.store().get(queued).unwrap().status(),
            JobStatus::Pending
        );

        assert!(coordinator.cancel(queued));
        wait_for_status(coordinator.store(), queued, JobStatus::Failed).await;
        assert_eq!(coordinator.cancel_all(), 1);
        coordinator.wait_idle().await;

        assert_eq!(encoder.starts.load(Ordering::SeqCst), 1);
        let queued_job = coordinator.store().get(queued).unwrap();
        assert!(queued_job.encoder_session().is_none());
        assert_eq!(queued_job.failure_reason(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "slow.mov");
        let cfg = EncoderConfig {
            encode_timeout_secs: Some(1),
            ..config(1)
        };
        let coordinator = EncodingCoordinator::new(
            &cfg,
            Arc::new(StallingEncoder::default()),
            Arc::new(FixedProbe { duration_ms: Some(4000) }),
        );

        let id = coordinator.submit(&[input]).await.created[0];
        coordinator.wait_idle().await;

        let job = coordinator.store().get(id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 25);
        assert_eq!(job.failure_reason(), Some("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_same_input_twice_is_rejected_while_active() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "dup.mov");
        let coordinator = EncodingCoordinator::new(
            &config(2),
            Arc::new(StallingEncoder::default()),
            Arc::new(FixedProbe { duration_ms: Some(4000) }),
        );

        let report = coordinator.submit(&[input.clone(), input]).await;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].1.contains("already queued"));

        coordinator.cancel_all();
        coordinator.wait_idle().await;
    }

    #[tokio::test]
    async fn test_encoder_that_drops_session_fails_job() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "vanish.mov");
        let coordinator = EncodingCoordinator::new(
            &config(1),
            ScriptedEncoder::new(vec![EncodeEvent::Sample(100)]),
            Arc::new(FixedProbe { duration_ms: Some(1000) }),
        );

        let id = coordinator.submit(&[input]).await.created[0];
        coordinator.wait_idle().await;

        let job = coordinator.store().get(id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 10);
        assert!(job.failure_reason().unwrap().contains("without a terminal event"));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_submission_in_progress() {
        let dir = TempDir::new().unwrap();
        let inputs: Vec<_> = ["a.mov", "b.mov", "c.mov", "d.mov"]
            .iter()
            .map(|name| touch(&dir, name))
            .collect();
        let encoder = ScriptedEncoder::new(success_after(&[500]));
        let coordinator = EncodingCoordinator::new(
            &config(2),
            encoder.clone(),
            Arc::new(SlowProbe {
                delay: Duration::from_millis(100),
            }),
        );

        let submitter = coordinator.clone();
        let submission = tokio::spawn(async move { submitter.submit(&inputs).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        coordinator.cancel_all();

        let report = submission.await.unwrap();
        coordinator.wait_idle().await;

        assert_eq!(report.created.len() + report.rejected.len(), 4);
        assert!(report.created.len() < 4);
        assert!(report
            .rejected
            .iter()
            .all(|(_, reason)| reason.as_str() == "cancelled"));
        assert_eq!(coordinator.store().len(), report.created.len());
        assert!(encoder.starts.load(Ordering::SeqCst) <= report.created.len());
        assert!(coordinator.store().snapshot().iter().all(|j| j.is_terminal()));
    }

    #[tokio::test]
    async fn test_nothing_is_queued_after_cancel_all() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "late.mov");
        let encoder = ScriptedEncoder::new(success_after(&[]));
        let coordinator = EncodingCoordinator::new(
            &config(1),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(1000) }),
        );

        assert_eq!(coordinator.cancel_all(), 0);
        assert!(coordinator.is_shut_down());

        let report = coordinator.submit(&[input]).await;
        coordinator.wait_idle().await;

        assert!(report.created.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].1, "cancelled");
        assert!(coordinator.store().is_empty());
        assert_eq!(encoder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_refused_after_cancel_all() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "queued.mov");
        let encoder = Arc::new(StallingEncoder::default());
        let coordinator = EncodingCoordinator::new(
            &config(1),
            encoder.clone(),
            Arc::new(FixedProbe { duration_ms: Some(4000) }),
        );

        let id = coordinator.submit(&[input]).await.created[0];
        wait_for_status(coordinator.store(), id, JobStatus::Encoding).await;
        assert_eq!(coordinator.cancel_all(), 1);
        coordinator.wait_idle().await;

        let job = coordinator.store().get(id).unwrap();
        assert_eq!(job.failure_reason(), Some("cancelled"));
        assert!(!coordinator.dispatch(id));
        assert!(!coordinator.dispatch(JobId::new()));
    }
}
