//! Cursor-paged REST import.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::mapping::{parse_rest_order, raw_order_id};
use super::{ImportDeps, ImportError, ImportStrategy, ImportSummary, Tally, percent};
use crate::checkpoint::Checkpoint;
use crate::jobs::{Job, JobControl, JobData, JobProgress};
use crate::retry::RetryError;
use crate::upstream::{PageInfo, PageRequest};

/// Progress never reads complete while pages remain.
const PAGING_PERCENT_CAP: f64 = 95.0;

/// Walks `orders.json` page by page, checkpointing after every page.
pub struct PaginatedImport {
    deps: Arc<ImportDeps>,
}

impl PaginatedImport {
    pub fn new(deps: Arc<ImportDeps>) -> Self {
        Self { deps }
    }

    /// Best-effort total for progress display.
    async fn count_total(&self, job: &Job, control: &JobControl) -> Result<Option<u64>, ImportError> {
        if !self.deps.config.count_total {
            return Ok(None);
        }
        control.gate().await?;
        let filter = job.data.filter().to_upstream();
        match self
            .deps
            .limiter
            .with_retry(control.token(), || self.deps.source.count_orders(&filter))
            .await
        {
            Ok(count) => Ok(Some(count)),
            Err(RetryError::Cancelled) => Err(ImportError::Interrupted),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "order count unavailable; continuing without a total");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ImportStrategy for PaginatedImport {
    async fn run(&self, job: &Job, control: &JobControl) -> Result<ImportSummary, ImportError> {
        let JobData::Paginated { filter, .. } = &job.data else {
            return Err(ImportError::InvalidJob("expected a paginated job".into()));
        };
        let deps = &self.deps;
        let limit = deps.config.page_size;
        let base_filter = filter.to_upstream();

        let checkpoint = deps.checkpoints.get(job.id).await?;
        let mut processed = checkpoint.as_ref().map_or(0, |c| c.processed_count);
        let mut last_id = checkpoint.as_ref().and_then(|c| c.last_processed_id.clone());
        let mut next = Some(match checkpoint.as_ref().and_then(|c| c.cursor.clone()) {
            Some(cursor) => PageRequest::Next { cursor, limit },
            None => PageRequest::First {
                filter: match &last_id {
                    Some(id) => base_filter.clone().with_since_id(id.clone()),
                    None => base_filter.clone(),
                },
                limit,
            },
        });
        if checkpoint.is_some() {
            info!(job_id = %job.id, processed, "resuming paginated import from checkpoint");
        }

        let mut tally = Tally::seeded(job, deps.manager.max_error_messages());
        let counted = self.count_total(job, control).await?.unwrap_or(0);
        let mut page_no: u64 = 0;

        while let Some(request) = next.take() {
            page_no += 1;
            control.gate().await?;
            let page = deps
                .limiter
                .with_retry(control.token(), || deps.source.fetch_page(&request))
                .await?;

            let page_len = page.orders.len() as u64;
            let total = counted.max(processed + page_len);
            debug!(job_id = %job.id, page = page_no, records = page_len, "page fetched");

            for (idx, raw) in page.orders.iter().enumerate() {
                let raw_id = raw_order_id(raw);
                match parse_rest_order(raw) {
                    Ok(order) => {
                        let outcome = deps.import_order(job.id, &order).await;
                        tally.record(&order.id, outcome);
                    }
                    Err(e) => tally.fail(raw_id.as_deref(), e),
                }
                if raw_id.is_some() {
                    last_id = raw_id;
                }

                let current = processed + idx as u64 + 1;
                deps.report(
                    job.id,
                    JobProgress::new(current, total, percent(current, total, PAGING_PERCENT_CAP)),
                    &tally,
                );
                control.gate().await?;
            }
            processed += page_len;

            next = match page.page_info {
                PageInfo::Next(cursor) => Some(PageRequest::Next { cursor, limit }),
                PageInfo::Last => None,
                PageInfo::Unknown if page_len < u64::from(limit) => None,
                PageInfo::Unknown => last_id.clone().map(|id| PageRequest::First {
                    filter: base_filter.clone().with_since_id(id),
                    limit,
                }),
            };

            deps.checkpoints
                .save(&Checkpoint {
                    cursor: match &next {
                        Some(PageRequest::Next { cursor, .. }) => Some(cursor.clone()),
                        _ => None,
                    },
                    processed_count: processed,
                    last_processed_id: last_id.clone(),
                    timestamp: Utc::now(),
                    ..Checkpoint::new(job.id)
                })
                .await?;

            if next.is_some() {
                deps.limiter
                    .sleep(deps.config.inter_page_delay, control.token())
                    .await?;
            }
        }

        let total = counted.max(processed);
        deps.report(
            job.id,
            JobProgress::new(processed, total, percent(processed, total, PAGING_PERCENT_CAP)),
            &tally,
        );
        info!(job_id = %job.id, pages = page_no, processed, "paginated import finished");
        Ok(tally.summary(processed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::import::test_support::{Harness, harness, test_config};
    use crate::upstream::UpstreamError;
    use crate::upstream::fake::{ScriptedOrderSource, sample_order, sample_orders};
    use ordersync_core::{DateRange, ImportFilter};

    fn paginated() -> JobData {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap();
        JobData::paginated(ImportFilter::new(DateRange::new(from, to)))
    }

    async fn run(h: &Harness, job: &Job) -> Result<ImportSummary, ImportError> {
        PaginatedImport::new(h.deps.clone())
            .run(job, &JobControl::new())
            .await
    }

    fn cursors(h: &Harness) -> Vec<Option<String>> {
        h.source
            .page_requests()
            .into_iter()
            .map(|r| match r {
                PageRequest::First { .. } => None,
                PageRequest::Next { cursor, .. } => Some(cursor),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn imports_every_page_and_checkpoints_the_last() {
        let h = harness(ScriptedOrderSource::new(sample_orders(5)), test_config());
        let job = h.running_job(paginated());

        let summary = run(&h, &job).await.unwrap();

        assert_eq!(summary.imported, 5);
        assert_eq!(summary.processed, 5);
        assert_eq!(h.book.count(), 5);
        assert_eq!(
            cursors(&h),
            vec![None, Some("cursor-2".into()), Some("cursor-4".into())]
        );

        let stored = h.deps.manager.get_job(job.id).unwrap();
        assert_eq!(stored.progress.current, 5);
        assert!(stored.progress.percentage <= PAGING_PERCENT_CAP);

        let cp = h.checkpoints.get(job.id).await.unwrap().unwrap();
        assert_eq!(cp.processed_count, 5);
        assert_eq!(cp.cursor, None);
        assert_eq!(cp.last_processed_id.as_deref(), Some("5"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_wait_for_retry_after() {
        let h = harness(ScriptedOrderSource::new(sample_orders(2)), test_config());
        h.source.rate_limit_next(2, Some(Duration::from_secs(3)));
        let job = h.running_job(paginated());

        let started = tokio::time::Instant::now();
        let summary = run(&h, &job).await.unwrap();

        assert_eq!(summary.imported, 2);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(h.source.page_requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_the_run_and_keep_the_checkpoint() {
        let h = harness(ScriptedOrderSource::new(sample_orders(4)), test_config());
        let job = h.running_job(paginated());
        h.source.fail_fetch_at(2, UpstreamError::Http { status: 500, body: "boom".into() });

        let err = run(&h, &job).await.unwrap_err();

        assert!(matches!(err, ImportError::Upstream(UpstreamError::Http { status: 500, .. })));
        let cp = h.checkpoints.get(job.id).await.unwrap().unwrap();
        assert_eq!(cp.cursor.as_deref(), Some("cursor-2"));
        assert_eq!(cp.processed_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_a_saved_cursor() {
        let h = harness(ScriptedOrderSource::new(sample_orders(5)), test_config());
        let job = h.running_job(paginated());
        h.checkpoints
            .save(&Checkpoint {
                cursor: Some("cursor-2".into()),
                processed_count: 2,
                last_processed_id: Some("2".into()),
                ..Checkpoint::new(job.id)
            })
            .await
            .unwrap();

        let summary = run(&h, &job).await.unwrap();

        assert_eq!(summary.imported, 3);
        assert_eq!(summary.processed, 5);
        assert_eq!(cursors(&h)[0].as_deref(), Some("cursor-2"));
        assert!(h.book.find_by_order("1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_since_id_without_link_headers() {
        let h = harness(
            ScriptedOrderSource::new(sample_orders(5)).without_link_headers(),
            test_config(),
        );
        let job = h.running_job(paginated());

        let summary = run(&h, &job).await.unwrap();

        assert_eq!(summary.imported, 5);
        let since: Vec<Option<String>> = h
            .source
            .page_requests()
            .into_iter()
            .map(|r| match r {
                PageRequest::First { filter, .. } => filter.since_id,
                PageRequest::Next { .. } => panic!("no cursors without link headers"),
            })
            .collect();
        assert_eq!(since, vec![None, Some("2".into()), Some("4".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_records_are_counted_and_the_rest_imported() {
        let mut orders = sample_orders(3);
        orders[1] = json!({ "id": 2, "order_number": "not-a-number" });
        let mut negative = sample_order(4);
        negative["line_items"][0]["quantity"] = json!(-2);
        orders.push(negative);
        let h = harness(ScriptedOrderSource::new(orders), test_config());
        let job = h.running_job(paginated());

        let summary = run(&h, &job).await.unwrap();

        assert_eq!(summary.imported, 2);
        assert_eq!(summary.failed, 2);
        let errors = h.deps.manager.get_job(job.id).unwrap().results.errors;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Order 2: "));
        assert!(errors[1].starts_with("Order 4: "));
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_job_over_the_same_orders_only_finds_duplicates() {
        let h = harness(ScriptedOrderSource::new(sample_orders(3)), test_config());
        let first = h.running_job(paginated());
        run(&h, &first).await.unwrap();

        let second = h.running_job(paginated());
        let summary = run(&h, &second).await.unwrap();

        assert_eq!(summary.imported, 0);
        assert_eq!(summary.duplicates, 3);
        assert_eq!(h.book.count(), 3);
        assert_eq!(h.idempotency.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_fetch_leaves_the_last_page_checkpoint() {
        let h = harness(ScriptedOrderSource::new(sample_orders(6)), test_config());
        let job = h.running_job(paginated());
        let entered = h.source.stall_fetch_at(4);
        let control = Arc::new(JobControl::new());

        let task = {
            let deps = h.deps.clone();
            let control = control.clone();
            let job = job.clone();
            tokio::spawn(async move { PaginatedImport::new(deps).run(&job, &control).await })
        };
        entered.notified().await;
        control.cancel();

        assert!(matches!(task.await.unwrap(), Err(ImportError::Interrupted)));
        let cp = h.checkpoints.get(job.id).await.unwrap().unwrap();
        assert_eq!(cp.cursor.as_deref(), Some("cursor-4"));
        assert_eq!(cp.processed_count, 4);
        assert_eq!(h.book.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_count_is_ignored() {
        let mut config = test_config();
        config.count_total = true;
        let h = harness(
            ScriptedOrderSource::new(sample_orders(2)).with_failing_count(),
            config,
        );
        let job = h.running_job(paginated());

        assert_eq!(run(&h, &job).await.unwrap().imported, 2);
    }

    #[tokio::test]
    async fn rejects_bulk_payloads() {
        let h = harness(ScriptedOrderSource::new(Vec::new()), test_config());
        let mut job = h.running_job(paginated());
        job.data = JobData::bulk(job.data.filter().clone());

        assert!(matches!(run(&h, &job).await, Err(ImportError::InvalidJob(_))));
    }
}
