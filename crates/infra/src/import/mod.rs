//! Import strategies: paginated REST paging and bulk export.
//!
//! Both strategies share the per-record path: parse, apply through the
//! idempotency guard, tally, report progress, then yield to the job's
//! pause/cancel gate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use ordersync_core::InvoiceId;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::ImportConfig;
use crate::idempotency::{GuardError, Guarded, IdempotencyGuard, order_invoice_key};
use crate::jobs::{Interrupted, Job, JobControl, JobData, JobId, JobManager, JobProgress, JobResults};
use crate::retry::{RateLimiter, RetryError};
use crate::upstream::{BulkStatus, OrderRecord, OrderSource, UpstreamError};

pub mod bulk;
pub mod invoice_book;
pub mod mapping;
pub mod paginated;

pub use bulk::BulkExportImport;
pub use invoice_book::{ApplyError, InvoiceBook, OrderApplier};
pub use paginated::PaginatedImport;

/// Everything a strategy needs, injected once.
pub struct ImportDeps {
    pub manager: Arc<JobManager>,
    pub source: Arc<dyn OrderSource>,
    pub limiter: RateLimiter,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub guard: Arc<IdempotencyGuard>,
    pub applier: Arc<dyn OrderApplier>,
    pub config: ImportConfig,
}

/// Final tallies of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Upstream records (paginated) or result lines (bulk) covered.
    pub processed: u64,
    pub imported: u64,
    pub failed: u64,
    pub duplicates: u64,
}

/// Why a strategy stopped early.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Cancelled by the operator; nothing to report.
    #[error("import interrupted")]
    Interrupted,
    #[error("upstream still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: UpstreamError },
    #[error(transparent)]
    Upstream(UpstreamError),
    #[error("bulk operation ended as {}: {}", .status.as_str(), .error_code.as_deref().unwrap_or("no error code"))]
    BulkOperation {
        status: BulkStatus,
        error_code: Option<String>,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("job payload does not match the strategy: {0}")]
    InvalidJob(String),
}

impl From<Interrupted> for ImportError {
    fn from(_: Interrupted) -> Self {
        ImportError::Interrupted
    }
}

impl From<RetryError<UpstreamError>> for ImportError {
    fn from(e: RetryError<UpstreamError>) -> Self {
        match e {
            RetryError::Permanent(e) => ImportError::Upstream(e),
            RetryError::Exhausted { attempts, last } => ImportError::RetriesExhausted { attempts, last },
            RetryError::Cancelled => ImportError::Interrupted,
        }
    }
}

/// A way of moving one job's orders into the invoice book.
#[async_trait]
pub trait ImportStrategy: Send + Sync {
    async fn run(&self, job: &Job, control: &JobControl) -> Result<ImportSummary, ImportError>;
}

/// Strategy for a job payload.
pub fn strategy_for(data: &JobData, deps: Arc<ImportDeps>) -> Box<dyn ImportStrategy> {
    match data {
        JobData::Paginated { .. } => Box::new(PaginatedImport::new(deps)),
        JobData::Bulk { .. } => Box::new(BulkExportImport::new(deps)),
    }
}

/// Percentage of `current` in `total`, capped at `cap`.
pub(crate) fn percent(current: u64, total: u64, cap: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((current as f64 / total as f64) * 100.0).min(cap)
}

impl ImportDeps {
    /// Apply one order at most once across all jobs.
    async fn import_order(
        &self,
        job_id: JobId,
        order: &OrderRecord,
    ) -> Result<Guarded<InvoiceId>, GuardError<ApplyError>> {
        let key = order_invoice_key(&order.id);
        self.guard
            .with_idempotency(&key, job_id, || self.applier.apply(order))
            .await
    }

    fn report(&self, job_id: JobId, progress: JobProgress, tally: &Tally) {
        self.manager
            .record_progress(job_id, progress, tally.results.clone());
    }
}

/// Running per-record counts, seeded from the job so a resumed run keeps
/// counting where the last one stopped.
pub(crate) struct Tally {
    job_id: JobId,
    results: JobResults,
    cap: usize,
}

impl Tally {
    pub(crate) fn seeded(job: &Job, cap: usize) -> Self {
        Self {
            job_id: job.id,
            results: job.results.clone(),
            cap,
        }
    }

    pub(crate) fn record(&mut self, order_id: &str, outcome: Result<Guarded<InvoiceId>, GuardError<ApplyError>>) {
        match outcome {
            Ok(Guarded::Applied(_)) => self.results.imported += 1,
            Ok(Guarded::Replayed(_)) => self.results.duplicates += 1,
            Err(e) => self.fail(Some(order_id), e),
        }
    }

    pub(crate) fn fail(&mut self, order_id: Option<&str>, reason: impl fmt::Display) {
        let order_id = order_id.unwrap_or("unknown");
        warn!(job_id = %self.job_id, order_id, error = %reason, "order not imported");
        self.results.failed += 1;
        self.results
            .push_error(format!("Order {order_id}: {reason}"), self.cap);
    }

    pub(crate) fn summary(&self, processed: u64) -> ImportSummary {
        ImportSummary {
            processed,
            imported: self.results.imported,
            failed: self.results.failed,
            duplicates: self.results.duplicates,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_capped_and_safe_on_empty_totals() {
        assert_eq!(percent(0, 0, 95.0), 0.0);
        assert_eq!(percent(50, 100, 95.0), 50.0);
        assert_eq!(percent(100, 100, 95.0), 95.0);
    }

    #[test]
    fn retry_outcomes_map_onto_import_errors() {
        let exhausted: ImportError = RetryError::Exhausted {
            attempts: 6,
            last: UpstreamError::Timeout,
        }
        .into();
        assert!(matches!(exhausted, ImportError::RetriesExhausted { attempts: 6, .. }));

        let cancelled: ImportError = RetryError::<UpstreamError>::Cancelled.into();
        assert!(matches!(cancelled, ImportError::Interrupted));
    }

    #[test]
    fn bulk_failures_name_status_and_code() {
        let err = ImportError::BulkOperation {
            status: BulkStatus::Failed,
            error_code: Some("ACCESS_DENIED".into()),
        };
        assert_eq!(err.to_string(), "bulk operation ended as FAILED: ACCESS_DENIED");
    }
}
