//! Thread-safe, insertion-ordered job collection with change notifications.
//!
//! All writes go through [`JobStore::append`] and [`JobStore::update`], both of
//! which hold the store lock only for the mutation itself. Observers are
//! notified after the lock is released, so an observer may read the store from
//! inside its callback.

use crate::job::{Job, JobError, JobId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateId(JobId),
    #[error("job {0} is not in the store")]
    UnknownJob(JobId),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// What part of a job changed, so consumers can redraw only that part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Status,
    Progress,
    Both,
}

/// Receives store notifications. Indices are insertion positions and never
/// shift, since the store does not remove jobs.
pub trait JobObserver: Send + Sync {
    fn on_job_inserted(&self, index: usize);
    fn on_job_changed(&self, index: usize, kind: ChangeKind);
}

/// A notification as a value, for consumers that drain a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Inserted { index: usize },
    Changed { index: usize, kind: ChangeKind },
}

/// Forwards notifications to an unbounded channel so they can be applied on a
/// single consumption context (a UI loop) instead of on worker tasks.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl JobObserver for ChannelObserver {
    fn on_job_inserted(&self, index: usize) {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.tx.send(StoreEvent::Inserted { index });
    }

    fn on_job_changed(&self, index: usize, kind: ChangeKind) {
        let _ = self.tx.send(StoreEvent::Changed { index, kind });
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
}

/// Single source of truth for job state.
#[derive(Default)]
pub struct JobStore {
    inner: RwLock<Inner>,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.observers.write().push(observer);
    }

    /// Add a job at the end. Rejects an id that is already present without
    /// touching existing entries.
    pub fn append(&self, job: Job) -> Result<usize, StoreError> {
        let index = {
            let mut inner = self.inner.write();
            let id = job.id();
            if inner.index.contains_key(&id) {
                return Err(StoreError::DuplicateId(id));
            }
            let index = inner.jobs.len();
            inner.jobs.push(job);
            inner.index.insert(id, index);
            index
        };

        for observer in self.observers() {
            observer.on_job_inserted(index);
        }
        Ok(index)
    }

    /// Snapshot of one job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        let inner = self.inner.read();
        inner.index.get(&id).map(|&i| inner.jobs[i].clone())
    }

    /// Snapshot of the job at a display index.
    pub fn job_at(&self, index: usize) -> Option<Job> {
        self.inner.read().jobs.get(index).cloned()
    }

    pub fn index_of(&self, id: JobId) -> Option<usize> {
        self.inner.read().index.get(&id).copied()
    }

    /// Does any job match `predicate`? Scans under the read lock without
    /// copying jobs.
    pub fn any_job<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Job) -> bool,
    {
        self.inner.read().jobs.iter().any(predicate)
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `mutation` to the job under the store lock, then notify
    /// observers with `kind`.
    ///
    /// The mutation works on a copy which is only written back when it
    /// succeeds, so a rejected mutation leaves the job exactly as it was and
    /// emits nothing.
    pub fn update<T, F>(&self, id: JobId, kind: ChangeKind, mutation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, JobError>,
    {
        let (index, value) = {
            let mut inner = self.inner.write();
            let index = *inner.index.get(&id).ok_or(StoreError::UnknownJob(id))?;
            let mut draft = inner.jobs[index].clone();
            let value = mutation(&mut draft)?;
            inner.jobs[index] = draft;
            (index, value)
        };

        for observer in self.observers() {
            observer.on_job_changed(index, kind);
        }
        Ok(value)
    }

    /// Point-in-time view of the store. Later mutations are not reflected.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            jobs: Arc::from(self.inner.read().jobs.clone()),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn JobObserver>> {
        self.observers.read().clone()
    }
}

/// Restartable view produced by [`JobStore::snapshot`]. Iterating does not
/// copy; cloning the snapshot shares the same jobs.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    jobs: Arc<[Job]>,
}

impl JobSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<'a> IntoIterator for &'a JobSnapshot {
    type Item = &'a Job;
    type IntoIter = std::slice::Iter<'a, Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.iter()
    }
}
