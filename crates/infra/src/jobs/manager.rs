//! Job records, transitions, and progress aggregation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::control::{AlreadyRunning, JobControls};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobAction, JobData, JobId, JobProgress, JobResults, JobStatus};

/// Default cap on error messages kept per job.
pub const DEFAULT_MAX_ERROR_MESSAGES: usize = 100;

/// Job management error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Partial update merged by [`JobManager::update_job`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    pub results: Option<JobResults>,
    pub data: Option<JobData>,
}

/// Owns job records and their state machine.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    controls: Arc<JobControls>,
    max_error_messages: usize,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, controls: Arc<JobControls>) -> Self {
        Self {
            store,
            controls,
            max_error_messages: DEFAULT_MAX_ERROR_MESSAGES,
        }
    }

    pub fn with_max_error_messages(mut self, max: usize) -> Self {
        self.max_error_messages = max;
        self
    }

    pub fn controls(&self) -> &Arc<JobControls> {
        &self.controls
    }

    pub fn max_error_messages(&self) -> usize {
        self.max_error_messages
    }

    /// Record a new pending job. Nothing runs until the orchestrator picks it up.
    pub fn create_job(&self, data: JobData) -> Result<JobId, JobError> {
        let job = Job::new(data, Utc::now());
        let kind = job.kind;
        let id = self.store.insert(job)?;
        info!(job_id = %id, ?kind, "import job created");
        Ok(id)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        match self.store.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job lookup failed");
                None
            }
        }
    }

    /// Most recent first, at most `limit`.
    pub fn list_jobs(&self, limit: usize) -> Vec<Job> {
        self.store.list(limit).unwrap_or_else(|e| {
            error!(error = %e, "job listing failed");
            Vec::new()
        })
    }

    pub fn has_active_jobs(&self) -> bool {
        self.list_jobs(usize::MAX)
            .iter()
            .any(|j| j.status.is_active())
    }

    /// Merge a partial update.
    ///
    /// Unknown ids are ignored. A status outside the transition graph is
    /// dropped with a warning while the other fields still apply.
    pub fn update_job(&self, job_id: JobId, update: JobUpdate) -> Option<Job> {
        let cap = self.max_error_messages;
        let result = self.store.modify(job_id, &mut |job| {
            let now = Utc::now();
            if let Some(status) = update.status {
                if job.status.can_transition_to(status) {
                    job.mark_status(status, now);
                } else if job.status != status {
                    warn!(job_id = %job_id, from = %job.status, to = %status, "ignoring disallowed status change");
                }
            }
            if let Some(data) = &update.data {
                job.set_data(data.clone(), now);
            }
            if update.progress.is_some() || update.results.is_some() {
                let progress = update.progress.clone().unwrap_or_else(|| job.progress.clone());
                let results = update.results.clone().unwrap_or_else(|| job.results.clone());
                job.merge_progress(&progress, &results, cap, now);
            }
        });
        match result {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job update failed");
                None
            }
        }
    }

    /// Move a job along the transition graph.
    pub fn transition(&self, job_id: JobId, to: JobStatus) -> Result<Job, JobError> {
        let mut rejected = None;
        let job = self
            .store
            .modify(job_id, &mut |job| {
                if job.status.can_transition_to(to) {
                    job.mark_status(to, Utc::now());
                } else {
                    rejected = Some(job.status);
                }
            })?
            .ok_or(JobError::NotFound(job_id))?;

        if let Some(from) = rejected {
            return Err(JobError::InvalidTransition { from, to });
        }
        debug!(job_id = %job_id, status = %to, "job transitioned");
        Ok(job)
    }

    /// Operator request: validate against the graph, update the record, then
    /// signal the worker.
    pub fn request_action(&self, job_id: JobId, action: JobAction) -> Result<JobStatus, JobError> {
        let job = self.transition(job_id, action.target())?;

        if let Some(control) = self.controls.get(job_id) {
            match action {
                JobAction::Pause => control.pause(),
                JobAction::Resume => control.resume(),
                JobAction::Cancel => control.cancel(),
            }
        }
        info!(job_id = %job_id, %action, status = %job.status, "job action applied");
        Ok(job.status)
    }

    /// Monotonic merge of a progress snapshot from a worker.
    pub fn record_progress(&self, job_id: JobId, progress: JobProgress, results: JobResults) {
        self.update_job(
            job_id,
            JobUpdate {
                progress: Some(progress),
                results: Some(results),
                ..JobUpdate::default()
            },
        );
    }

    /// Append one bounded error message.
    pub fn append_error(&self, job_id: JobId, message: &str) {
        let cap = self.max_error_messages;
        if let Err(e) = self.store.modify(job_id, &mut |job| {
            job.results.push_error(message, cap);
            job.updated_at = Utc::now();
        }) {
            error!(job_id = %job_id, error = %e, "could not record job error");
        }
    }

    /// Drop terminal jobs that finished more than `max_age` before `now`.
    pub fn prune_finished(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        match self.store.remove_where(&|job| {
            job.status.is_terminal() && job.completed_at.unwrap_or(job.updated_at) < cutoff
        }) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "pruned finished jobs");
                }
                removed
            }
            Err(e) => {
                error!(error = %e, "job pruning failed");
                0
            }
        }
    }
}
