use serde::{Deserialize, Serialize};

use ordersync_core::filters::{DateRangeValidation, NamedRange};
use ordersync_infra::checkpoint::Checkpoint;
use ordersync_infra::jobs::{Job, JobKind, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImportRequest {
    pub mode: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    /// Continue a failed or cancelled job from its checkpoint.
    pub resume_job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionRequest {
    pub job_id: Option<String>,
    pub action: Option<String>,
}

/// Parse the `mode` field. `rest` is accepted as a legacy name for paginated.
pub fn parse_mode(mode: Option<&str>) -> Option<JobKind> {
    match mode?.trim().to_ascii_lowercase().as_str() {
        "paginated" | "rest" => Some(JobKind::PaginatedImport),
        "bulk" => Some(JobKind::BulkImport),
        _ => None,
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImportResponse {
    pub success: bool,
    pub job_id: String,
    pub message: String,
    pub estimated_duration: &'static str,
}

impl StartImportResponse {
    pub fn started(job: &Job) -> Self {
        let (label, estimated_duration) = match job.kind {
            JobKind::PaginatedImport => ("Paginated", "2-5 minutes per 1000 orders"),
            JobKind::BulkImport => ("Bulk", "5-10 minutes"),
        };
        Self {
            success: true,
            job_id: job.id.to_string(),
            message: format!("{label} import started"),
            estimated_duration,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetailResponse {
    pub job: Job,
    pub checkpoint: Option<Checkpoint>,
    pub can_resume: bool,
    pub can_cancel: bool,
    /// A new job may continue this one via `resumeJobId`.
    pub can_retry: bool,
}

impl JobDetailResponse {
    pub fn new(job: Job, checkpoint: Option<Checkpoint>) -> Self {
        let status = job.status;
        Self {
            can_resume: status == JobStatus::Paused && checkpoint.is_some(),
            can_cancel: status.can_transition_to(JobStatus::Cancelled),
            can_retry: matches!(status, JobStatus::Failed | JobStatus::Cancelled),
            job,
            checkpoint,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionResponse {
    pub success: bool,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PresetsResponse {
    pub presets: Vec<NamedRange>,
}

/// Body of a rejected date range.
#[derive(Debug, Serialize)]
pub struct InvalidRangeResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<NamedRange>,
}

impl InvalidRangeResponse {
    pub fn from_validation(validation: DateRangeValidation) -> Self {
        Self {
            error: "invalid_date_range",
            message: validation
                .error
                .unwrap_or_else(|| "invalid date range".to_string()),
            suggestion: validation.corrected_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_accept_the_legacy_rest_name() {
        assert_eq!(parse_mode(Some("paginated")), Some(JobKind::PaginatedImport));
        assert_eq!(parse_mode(Some("REST")), Some(JobKind::PaginatedImport));
        assert_eq!(parse_mode(Some("bulk")), Some(JobKind::BulkImport));
        assert_eq!(parse_mode(Some("graphql")), None);
        assert_eq!(parse_mode(None), None);
    }
}
