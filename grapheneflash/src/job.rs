//! Flash jobs: cancellation tokens, caller-owned handles and the
//! one-job-per-device store.
//!
//! Nothing here is global. A front end that runs several jobs creates one
//! [`InMemoryJobStore`] (or its own [`JobStore`]) and hands it to whoever
//! starts jobs; the state machine itself only ever sees a [`CancelToken`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error::{Error, Result};
use crate::flasher::{FlashObserver, FlashOutcome, FlashProgress, LogLevel};

/// Cooperative cancellation flag shared between a job and its owner.
///
/// Cancellation is observed between polling ticks, phases and partition
/// writes. A flash command that is already running always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Job identifier, unique within one store.
pub type JobId = u64;

/// Last known status of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Claimed, not started yet.
    Pending,
    /// Running; carries the latest progress event.
    Running(FlashProgress),
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed(String),
    /// Stopped on request.
    Cancelled,
}

impl JobStatus {
    /// Whether the job has finished one way or another.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
    }
}

/// Status cell shared by a store record and the job's handles.
type StatusCell = Arc<Mutex<JobStatus>>;

fn read_status(cell: &StatusCell) -> JobStatus {
    cell.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_status(cell: &StatusCell, status: JobStatus) {
    *cell.lock().unwrap_or_else(PoisonError::into_inner) = status;
}

/// Caller-owned handle to one flash job.
///
/// The handle keeps reporting the final status after the store has
/// forgotten the job.
#[derive(Debug, Clone)]
pub struct FlashJob {
    id: JobId,
    serial: String,
    cancel: CancelToken,
    status: StatusCell,
}

impl FlashJob {
    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Serial of the device this job owns.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Latest status recorded for this job.
    pub fn status(&self) -> JobStatus {
        read_status(&self.status)
    }

    /// Token to hand to the state machine.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask the job to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Thread-safe job bookkeeping enforcing one active job per serial.
pub trait JobStore: Send + Sync {
    /// Reserve `serial` for a new job.
    ///
    /// Fails with [`Error::DeviceBusy`] while another job for the same serial
    /// has not finished.
    fn claim(&self, serial: &str) -> Result<FlashJob>;

    /// Record a status change.
    fn update(&self, id: JobId, status: JobStatus);

    /// Current status, if the job is known.
    fn status(&self, id: JobId) -> Option<JobStatus>;

    /// Record the terminal outcome and release the serial.
    fn finish(&self, id: JobId, outcome: &FlashOutcome);

    /// Active job for `serial`, if any.
    fn active_job(&self, serial: &str) -> Option<JobId>;

    /// Forget a finished job and return its final status.
    ///
    /// Unfinished jobs are kept and `None` is returned.
    fn remove(&self, id: JobId) -> Option<JobStatus>;

    /// Forget every finished job, returning how many were dropped.
    fn prune_finished(&self) -> usize;
}

#[derive(Debug)]
struct JobRecord {
    serial: String,
    status: StatusCell,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: JobId,
    jobs: HashMap<JobId, JobRecord>,
    active: HashMap<String, JobId>,
}

/// [`JobStore`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobStore for InMemoryJobStore {
    fn claim(&self, serial: &str) -> Result<FlashJob> {
        let mut inner = self.lock();
        if inner.active.contains_key(serial) {
            return Err(Error::DeviceBusy(serial.to_string()));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let status = Arc::new(Mutex::new(JobStatus::Pending));
        inner.jobs.insert(
            id,
            JobRecord {
                serial: serial.to_string(),
                status: Arc::clone(&status),
            },
        );
        inner.active.insert(serial.to_string(), id);
        debug!("Job {id} claimed {serial}");

        Ok(FlashJob {
            id,
            serial: serial.to_string(),
            cancel: CancelToken::new(),
            status,
        })
    }

    fn update(&self, id: JobId, status: JobStatus) {
        if let Some(record) = self.lock().jobs.get(&id) {
            write_status(&record.status, status);
        }
    }

    fn status(&self, id: JobId) -> Option<JobStatus> {
        self.lock().jobs.get(&id).map(|r| read_status(&r.status))
    }

    fn finish(&self, id: JobId, outcome: &FlashOutcome) {
        let status = match &outcome.error {
            None if outcome.success => JobStatus::Succeeded,
            Some(Error::Cancelled) => JobStatus::Cancelled,
            Some(e) => JobStatus::Failed(e.to_string()),
            None => JobStatus::Failed(format!("stopped in state {}", outcome.final_state)),
        };

        let mut inner = self.lock();
        let Some(record) = inner.jobs.get(&id) else {
            return;
        };
        write_status(&record.status, status);
        let serial = record.serial.clone();
        if inner.active.get(&serial) == Some(&id) {
            inner.active.remove(&serial);
        }
        debug!("Job {id} released {serial}");
    }

    fn active_job(&self, serial: &str) -> Option<JobId> {
        self.lock().active.get(serial).copied()
    }

    fn remove(&self, id: JobId) -> Option<JobStatus> {
        let mut inner = self.lock();
        let status = read_status(&inner.jobs.get(&id)?.status);
        if !status.is_finished() {
            return None;
        }
        inner.jobs.remove(&id);
        Some(status)
    }

    fn prune_finished(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, record| !read_status(&record.status).is_finished());
        let pruned = before - inner.jobs.len();
        if pruned > 0 {
            debug!("Pruned {pruned} finished jobs");
        }
        pruned
    }
}

/// Observer that mirrors progress into a [`JobStore`] before forwarding.
pub struct JobObserver<'a, O: FlashObserver> {
    store: &'a dyn JobStore,
    id: JobId,
    inner: O,
}

impl<'a, O: FlashObserver> JobObserver<'a, O> {
    /// Wrap `inner`, recording progress for job `id`.
    pub fn new(store: &'a dyn JobStore, id: JobId, inner: O) -> Self {
        Self { store, id, inner }
    }
}

impl<O: FlashObserver> FlashObserver for JobObserver<'_, O> {
    fn on_progress(&mut self, progress: &FlashProgress) {
        self.store
            .update(self.id, JobStatus::Running(progress.clone()));
        self.inner.on_progress(progress);
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        self.inner.on_log(message, level);
    }
}
