//! Per-job pause/cancel signalling.
//!
//! A [`JobControl`] pairs a cancellation token with a pause flag. Workers
//! await [`JobControl::gate`] at every suspension point; operators flip the
//! signals through the [`JobControls`] registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::types::JobId;

/// The job was cancelled while a worker was waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job interrupted")]
pub struct Interrupted;

/// Pause flag and cancellation token for one job.
#[derive(Debug)]
pub struct JobControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused,
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the job may proceed.
    ///
    /// Returns immediately when running, blocks while paused, and fails with
    /// [`Interrupted`] once cancelled (including while paused).
    pub async fn gate(&self) -> Result<(), Interrupted> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupted);
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupted),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Interrupted);
                    }
                }
            }
        }
    }

    /// Sleep that ends early on cancellation. Pausing does not interrupt it.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        cancellable_sleep(duration, &self.cancel).await
    }
}

pub(crate) async fn cancellable_sleep(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), Interrupted> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Registration failed because a worker already drives the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job {0} is already running")]
pub struct AlreadyRunning(pub JobId);

/// Registry of live job controls: at most one per job id.
#[derive(Debug, Default)]
pub struct JobControls {
    inner: Mutex<HashMap<JobId, Arc<JobControl>>>,
}

impl JobControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the control slot for `job_id`.
    ///
    /// The slot is released when the returned lease is dropped, including
    /// when the owning task is aborted.
    pub fn register(self: &Arc<Self>, job_id: JobId) -> Result<ControlLease, AlreadyRunning> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.contains_key(&job_id) {
            return Err(AlreadyRunning(job_id));
        }
        let control = Arc::new(JobControl::new());
        inner.insert(job_id, control.clone());
        Ok(ControlLease {
            job_id,
            control,
            registry: Arc::clone(self),
        })
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<JobControl>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.get(job_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, job_id: JobId, control: &Arc<JobControl>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.get(&job_id).is_some_and(|c| Arc::ptr_eq(c, control)) {
            inner.remove(&job_id);
        }
    }
}

/// Exclusive claim on a job's control; deregisters on drop.
#[derive(Debug)]
pub struct ControlLease {
    job_id: JobId,
    control: Arc<JobControl>,
    registry: Arc<JobControls>,
}

impl ControlLease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }
}

impl Drop for ControlLease {
    fn drop(&mut self) {
        self.registry.release(self.job_id, &self.control);
    }
}
