//! Binds jobs to strategies and drives them to a terminal state.
//!
//! The orchestrator is the only place a job becomes `completed` or `failed`.
//! Operator actions (pause, resume, cancel) go through
//! [`JobManager::request_action`], which flips the job's control; the worker
//! observes it at its next gate.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use super::control::{ControlLease, JobControl};
use super::manager::{JobError, JobManager};
use super::types::{JobId, JobStatus};
use crate::import::{ImportDeps, ImportError, ImportSummary, strategy_for};

pub struct Orchestrator {
    manager: Arc<JobManager>,
    deps: Arc<ImportDeps>,
}

impl Orchestrator {
    pub fn new(deps: Arc<ImportDeps>) -> Self {
        Self {
            manager: deps.manager.clone(),
            deps,
        }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn deps(&self) -> &Arc<ImportDeps> {
        &self.deps
    }

    /// Start a worker task for `job_id`.
    ///
    /// Fails if the job is unknown, already finished, or already driven by
    /// another worker.
    pub fn spawn(self: &Arc<Self>, job_id: JobId) -> Result<JoinHandle<()>, JobError> {
        let lease = self.claim(job_id)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(
            async move { this.drive(lease).await }
                .instrument(info_span!("import_job", job_id = %job_id)),
        ))
    }

    /// Drive `job_id` on the current task until it stops.
    pub async fn run(&self, job_id: JobId) -> Result<(), JobError> {
        let lease = self.claim(job_id)?;
        self.drive(lease)
            .instrument(info_span!("import_job", job_id = %job_id))
            .await;
        Ok(())
    }

    /// Re-adopt `running`/`paused` jobs that have no live worker.
    ///
    /// Paused jobs come back paused. Each resumes from its checkpoint.
    pub fn recover(self: &Arc<Self>) -> Vec<JobId> {
        let controls = self.manager.controls();
        let orphans: Vec<_> = self
            .manager
            .list_jobs(usize::MAX)
            .into_iter()
            .filter(|j| j.status.is_active() && j.status != JobStatus::Pending)
            .filter(|j| !controls.is_registered(j.id))
            .collect();

        let mut recovered = Vec::with_capacity(orphans.len());
        for job in orphans {
            match self.spawn(job.id) {
                Ok(_) => {
                    info!(job_id = %job.id, status = %job.status, "recovered orphaned job");
                    recovered.push(job.id);
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "could not recover job"),
            }
        }
        recovered
    }

    fn claim(&self, job_id: JobId) -> Result<ControlLease, JobError> {
        let job = self
            .manager
            .get_job(job_id)
            .ok_or(JobError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let lease = self.manager.controls().register(job_id)?;
        if job.status == JobStatus::Paused {
            lease.control().pause();
        }
        Ok(lease)
    }

    async fn drive(&self, lease: ControlLease) {
        let job_id = lease.job_id();
        let control = lease.control().clone();

        let job = match self.manager.get_job(job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                match self.manager.transition(job_id, JobStatus::Running) {
                    Ok(job) => job,
                    Err(e) => {
                        error!(error = %e, "could not start job");
                        return;
                    }
                }
            }
            Some(job) => job,
            None => {
                warn!("job vanished before it started");
                return;
            }
        };
        info!(kind = ?job.kind, "import started");

        let outcome = strategy_for(&job.data, self.deps.clone())
            .run(&job, &control)
            .await;

        match outcome {
            Ok(summary) => self.complete(job_id, &control, summary).await,
            Err(ImportError::Interrupted) => info!("import cancelled"),
            Err(e) => self.fail(job_id, &control, &e).await,
        }
        drop(lease);
    }

    async fn complete(&self, job_id: JobId, control: &JobControl, summary: ImportSummary) {
        if !self.settle(job_id, control, JobStatus::Completed).await {
            return;
        }
        if let Err(e) = self.deps.checkpoints.clear(job_id).await {
            warn!(error = %e, "could not clear checkpoint of completed job");
        }
        info!(
            imported = summary.imported,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "import completed"
        );
    }

    async fn fail(&self, job_id: JobId, control: &JobControl, err: &ImportError) {
        error!(error = %err, "import failed");
        self.manager.append_error(job_id, &err.to_string());
        self.settle(job_id, control, JobStatus::Failed).await;
    }

    /// Move a running job to `to`, waiting out a pause first.
    ///
    /// Returns false when the job was cancelled or can no longer move.
    async fn settle(&self, job_id: JobId, control: &JobControl, to: JobStatus) -> bool {
        loop {
            if control.gate().await.is_err() {
                return false;
            }
            match self.manager.transition(job_id, to) {
                Ok(_) => return true,
                Err(JobError::InvalidTransition {
                    from: JobStatus::Paused,
                    ..
                }) => tokio::task::yield_now().await,
                Err(e) => {
                    warn!(error = %e, status = %to, "could not record final status");
                    return false;
                }
            }
        }
    }
}
