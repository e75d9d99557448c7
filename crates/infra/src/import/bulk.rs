//! Bulk-export import: submit one remote export, poll it, stream the result.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::mapping::{group_bulk_lines, order_from_bulk_node, raw_order_id};
use super::{ImportDeps, ImportError, ImportStrategy, ImportSummary, Tally};
use crate::checkpoint::Checkpoint;
use crate::jobs::{Job, JobControl, JobData, JobProgress, JobUpdate};
use crate::upstream::{BulkOperation, BulkStatus};

/// Reported while the remote export runs.
const POLLING_PERCENT: f64 = 50.0;
/// Reported at most while streaming the result.
const STREAMING_PERCENT_CAP: f64 = 99.0;

pub struct BulkExportImport {
    deps: Arc<ImportDeps>,
}

impl BulkExportImport {
    pub fn new(deps: Arc<ImportDeps>) -> Self {
        Self { deps }
    }

    /// Submit the export and remember its handle on the job and in a checkpoint.
    async fn submit(&self, job: &Job, control: &JobControl) -> Result<String, ImportError> {
        let deps = &self.deps;
        let filter = job.data.filter();
        let query = filter.to_upstream().to_search_query();

        control.gate().await?;
        let operation = deps
            .limiter
            .with_retry(control.token(), || deps.source.submit_bulk_export(&query))
            .await?;
        info!(job_id = %job.id, operation_id = %operation.id, "bulk export submitted");

        deps.manager.update_job(
            job.id,
            JobUpdate {
                data: Some(JobData::Bulk {
                    filter: filter.clone(),
                    operation_id: Some(operation.id.clone()),
                }),
                ..JobUpdate::default()
            },
        );
        deps.checkpoints
            .save(&Checkpoint {
                bulk_operation_id: Some(operation.id.clone()),
                ..Checkpoint::new(job.id)
            })
            .await?;
        Ok(operation.id)
    }

    /// Poll until the export leaves its in-progress states.
    async fn wait_for(
        &self,
        job: &Job,
        operation_id: &str,
        control: &JobControl,
        tally: &Tally,
    ) -> Result<BulkOperation, ImportError> {
        let deps = &self.deps;
        loop {
            control.gate().await?;
            let operation = deps
                .limiter
                .with_retry(control.token(), || deps.source.bulk_operation(operation_id))
                .await?;

            match operation.status {
                BulkStatus::Completed => return Ok(operation),
                status if status.is_in_progress() => {
                    deps.report(
                        job.id,
                        JobProgress::new(operation.object_count, operation.object_count, POLLING_PERCENT),
                        tally,
                    );
                    deps.limiter
                        .sleep(deps.config.poll_interval, control.token())
                        .await?;
                }
                status => {
                    return Err(ImportError::BulkOperation {
                        status,
                        error_code: operation.error_code,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ImportStrategy for BulkExportImport {
    async fn run(&self, job: &Job, control: &JobControl) -> Result<ImportSummary, ImportError> {
        let JobData::Bulk { operation_id, .. } = &job.data else {
            return Err(ImportError::InvalidJob("expected a bulk job".into()));
        };
        let deps = &self.deps;

        let checkpoint = deps.checkpoints.get(job.id).await?;
        let done_units = checkpoint.as_ref().map_or(0, |c| c.processed_count);
        let known = checkpoint
            .and_then(|c| c.bulk_operation_id)
            .or_else(|| operation_id.clone());
        let operation_id = match known {
            Some(id) => {
                info!(job_id = %job.id, operation_id = %id, done_units, "reattaching to bulk export");
                id
            }
            None => self.submit(job, control).await?,
        };

        let mut tally = Tally::seeded(job, deps.manager.max_error_messages());
        let operation = self.wait_for(job, &operation_id, control, &tally).await?;

        let Some(url) = operation.url else {
            info!(job_id = %job.id, operation_id = %operation_id, "bulk export matched no orders");
            return Ok(tally.summary(0));
        };

        control.gate().await?;
        let body = deps
            .limiter
            .with_retry(control.token(), || deps.source.download(&url))
            .await?;
        let total = body.lines().count() as u64;
        let units = group_bulk_lines(&body);
        info!(job_id = %job.id, lines = total, orders = units.len(), "bulk result downloaded");

        let every = deps.config.bulk_checkpoint_every.max(1);
        let mut since_checkpoint = 0;
        // Child rows may trail their parent anywhere in the file, so a line
        // number is no resume point; the unit index is.
        let skip = usize::try_from(done_units).unwrap_or(usize::MAX).min(units.len());
        let mut lines_done = units[..skip].iter().map(|u| u.end_line).max().unwrap_or(0);
        let mut units_done = skip as u64;

        for unit in units.into_iter().skip(skip) {
            match unit.node {
                Ok(node) => match order_from_bulk_node(&node) {
                    Ok(order) => {
                        let outcome = deps.import_order(job.id, &order).await;
                        tally.record(&order.id, outcome);
                    }
                    Err(e) => tally.fail(raw_order_id(&node).as_deref(), e),
                },
                Err(reason) => tally.fail(None, reason),
            }
            units_done += 1;
            lines_done = lines_done.max(unit.end_line);

            let percentage = (50.0 + 50.0 * lines_done as f64 / total.max(1) as f64)
                .min(STREAMING_PERCENT_CAP);
            deps.report(job.id, JobProgress::new(lines_done, total, percentage), &tally);

            since_checkpoint += 1;
            if since_checkpoint >= every {
                since_checkpoint = 0;
                deps.checkpoints
                    .save(&Checkpoint {
                        processed_count: units_done,
                        bulk_operation_id: Some(operation_id.clone()),
                        timestamp: Utc::now(),
                        ..Checkpoint::new(job.id)
                    })
                    .await?;
            }
            control.gate().await?;
        }

        info!(job_id = %job.id, operation_id = %operation_id, lines = lines_done, orders = units_done, "bulk import finished");
        Ok(tally.summary(lines_done))
    }
}
