//! Core job types and the job state machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordersync_core::ImportFilter;
pub use ordersync_core::JobId;

/// Longest error message kept on a job.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Job type, always derived from the [`JobData`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PaginatedImport,
    BulkImport,
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up
    Pending,
    /// A worker is driving the job
    Running,
    /// Suspended on request; strategy state is kept in memory
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Pending or in flight.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The allowed transition graph. Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control request from an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
}

impl JobAction {
    /// Status the job moves to when the action is accepted.
    pub fn target(&self) -> JobStatus {
        match self {
            JobAction::Pause => JobStatus::Paused,
            JobAction::Resume => JobStatus::Running,
            JobAction::Cancel => JobStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(JobAction::Pause),
            "resume" => Ok(JobAction::Resume),
            "cancel" => Ok(JobAction::Cancel),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Strategy-specific job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobData {
    Paginated {
        filter: ImportFilter,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_from: Option<JobId>,
    },
    Bulk {
        filter: ImportFilter,
        /// Remote bulk operation handle, once submitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
    },
}

impl JobData {
    pub fn paginated(filter: ImportFilter) -> Self {
        JobData::Paginated {
            filter,
            resumed_from: None,
        }
    }

    pub fn bulk(filter: ImportFilter) -> Self {
        JobData::Bulk {
            filter,
            operation_id: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobData::Paginated { .. } => JobKind::PaginatedImport,
            JobData::Bulk { .. } => JobKind::BulkImport,
        }
    }

    pub fn filter(&self) -> &ImportFilter {
        match self {
            JobData::Paginated { filter, .. } | JobData::Bulk { filter, .. } => filter,
        }
    }
}

/// Live progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    /// Seconds, extrapolated from throughput since the job started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
}

impl JobProgress {
    pub fn new(current: u64, total: u64, percentage: f64) -> Self {
        Self {
            current,
            total,
            percentage,
            estimated_time_remaining: None,
        }
    }
}

/// Per-record tallies of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResults {
    pub imported: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub errors: Vec<String>,
}

impl JobResults {
    pub fn processed(&self) -> u64 {
        self.imported + self.failed + self.duplicates
    }

    /// Append a message, truncated, unless `cap` messages are already kept.
    pub fn push_error(&mut self, message: impl AsRef<str>, cap: usize) {
        if self.errors.len() >= cap {
            return;
        }
        self.errors.push(truncate_message(message.as_ref()));
    }
}

pub(crate) fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// An import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub data: JobData,
    pub progress: JobProgress,
    pub results: JobResults,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(data: JobData, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: data.kind(),
            status: JobStatus::Pending,
            data,
            progress: JobProgress::default(),
            results: JobResults::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Replace the payload, keeping `kind` in step with it.
    pub fn set_data(&mut self, data: JobData, now: DateTime<Utc>) {
        self.kind = data.kind();
        self.data = data;
        self.updated_at = now;
    }

    /// Apply a status change. Callers check the transition graph first.
    pub fn mark_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
            self.progress.estimated_time_remaining = None;
        }
        if status == JobStatus::Completed {
            self.progress.total = self.progress.total.max(self.progress.current);
            self.progress.percentage = 100.0;
        }
    }

    /// Monotonic merge of a progress snapshot.
    pub fn merge_progress(
        &mut self,
        progress: &JobProgress,
        results: &JobResults,
        cap: usize,
        now: DateTime<Utc>,
    ) {
        let p = &mut self.progress;
        p.current = p.current.max(progress.current);
        p.total = progress.total.max(p.current);
        if progress.percentage.is_finite() {
            p.percentage = p.percentage.max(progress.percentage.clamp(0.0, 100.0));
        }
        p.estimated_time_remaining = self
            .started_at
            .and_then(|started| estimate_remaining(started, now, p.current, p.total));

        let r = &mut self.results;
        r.imported = r.imported.max(results.imported);
        r.failed = r.failed.max(results.failed);
        r.duplicates = r.duplicates.max(results.duplicates);
        if results.errors.len() > r.errors.len() {
            r.errors = results
                .errors
                .iter()
                .take(cap)
                .map(|m| truncate_message(m))
                .collect();
        }

        self.updated_at = now;
    }
}

fn estimate_remaining(
    started: DateTime<Utc>,
    now: DateTime<Utc>,
    current: u64,
    total: u64,
) -> Option<u64> {
    if current == 0 || total <= current {
        return None;
    }
    let elapsed_ms = (now - started).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let per_record_ms = elapsed_ms as f64 / current as f64;
    Some(((total - current) as f64 * per_record_ms / 1000.0).ceil() as u64)
}
