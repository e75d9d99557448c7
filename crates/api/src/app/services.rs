//! Service wiring: stores, the job manager, the orchestrator, and the janitor.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};

use ordersync_core::FilterTranslator;
use ordersync_infra::{
    checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore},
    config::{AppConfig, ImportConfig, StorageConfig},
    idempotency::{FileIdempotencyStore, IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore},
    import::{ImportDeps, InvoiceBook},
    jobs::{FileJobStore, InMemoryJobStore, JobControls, JobManager, JobStore, Orchestrator},
    retry::RateLimiter,
    upstream::OrderSource,
};

/// Shared state behind every handler.
pub struct AppServices {
    pub manager: Arc<JobManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub invoices: Arc<InvoiceBook>,
    pub filters: FilterTranslator,
    pub config: ImportConfig,
}

/// Stores chosen from [`StorageConfig`].
///
/// Jobs, checkpoints, idempotency records, and invoices share one lifetime:
/// recovery needs the job record, and a replayed idempotency record is only
/// meaningful while the invoice it names still exists.
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub invoices: Arc<InvoiceBook>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            invoices: Arc::new(InvoiceBook::new()),
        }
    }

    /// Files under `state_dir` when set, Postgres checkpoints when a
    /// database URL is configured and the `postgres` feature is on,
    /// memory otherwise.
    pub async fn open(storage: &StorageConfig) -> anyhow::Result<Self> {
        let mut stores = Self::in_memory();

        if let Some(dir) = &storage.state_dir {
            stores.jobs = FileJobStore::arc(dir.join("jobs")).context("opening job directory")?;
            stores.checkpoints = Arc::new(
                FileCheckpointStore::open(dir.join("checkpoints"))
                    .await
                    .context("opening checkpoint directory")?,
            );
            stores.idempotency = Arc::new(
                FileIdempotencyStore::open(dir.join("idempotency.jsonl"))
                    .await
                    .context("opening idempotency log")?,
            );
            stores.invoices = Arc::new(
                InvoiceBook::open(dir.join("invoices.jsonl"))
                    .await
                    .context("opening invoice log")?,
            );
        } else {
            tracing::warn!("ORDERSYNC_STATE_DIR not set; jobs, checkpoints, and invoices live in memory");
        }

        #[cfg(feature = "postgres")]
        {
            if let Some(url) = &storage.database_url {
                stores.checkpoints = Arc::new(
                    ordersync_infra::checkpoint::PostgresCheckpointStore::connect(url)
                        .await
                        .context("connecting checkpoint database")?,
                );
            }
        }

        Ok(stores)
    }
}

impl AppServices {
    pub fn new(source: Arc<dyn OrderSource>, stores: Stores, config: ImportConfig) -> Self {
        let manager = Arc::new(
            JobManager::new(stores.jobs.clone(), Arc::new(JobControls::new()))
                .with_max_error_messages(config.max_error_messages),
        );
        let invoices = stores.invoices.clone();
        let deps = Arc::new(ImportDeps {
            manager: manager.clone(),
            source,
            limiter: RateLimiter::new(config.retry.clone()),
            checkpoints: stores.checkpoints.clone(),
            guard: Arc::new(IdempotencyGuard::new(stores.idempotency.clone())),
            applier: invoices.clone(),
            config: config.clone(),
        });

        Self {
            manager,
            orchestrator: Arc::new(Orchestrator::new(deps)),
            checkpoints: stores.checkpoints,
            idempotency: stores.idempotency,
            invoices,
            filters: FilterTranslator::new(config.timezone),
            config,
        }
    }

    /// Production wiring from a loaded [`AppConfig`].
    pub async fn from_config(config: &AppConfig, source: Arc<dyn OrderSource>) -> anyhow::Result<Self> {
        let stores = Stores::open(&config.storage).await?;
        Ok(Self::new(source, stores, config.import.clone()))
    }

    /// One housekeeping pass: drop old terminal jobs, then old idempotency
    /// records while nothing is importing.
    pub async fn janitor_pass(&self, now: DateTime<Utc>) {
        let job_retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.manager.prune_finished(job_retention, now);

        if self.manager.has_active_jobs() {
            tracing::debug!("import active; idempotency pruning skipped");
            return;
        }
        let retention = chrono::Duration::from_std(self.config.idempotency_retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        match self.idempotency.prune_older_than(now - retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "pruned idempotency records"),
            Err(e) => tracing::warn!(error = %e, "idempotency pruning failed"),
        }
    }

    /// Run [`Self::janitor_pass`] every `janitor_interval`, forever.
    pub async fn run_janitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.janitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.janitor_pass(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ordersync_core::{DateRange, ImportFilter};
    use ordersync_infra::idempotency::IdempotencyRecord;
    use ordersync_infra::jobs::{JobData, JobStatus};
    use ordersync_infra::upstream::fake::ScriptedOrderSource;

    use super::*;

    fn services() -> AppServices {
        AppServices::new(
            Arc::new(ScriptedOrderSource::new(Vec::new())),
            Stores::in_memory(),
            ImportConfig::default(),
        )
    }

    fn record(key: &str, created_at: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.to_string(),
            value: serde_json::json!("x"),
            job_id: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn janitor_skips_idempotency_while_a_job_is_active() {
        let services = services();
        let now = Utc::now();
        services
            .idempotency
            .put(record("old", now - chrono::Duration::days(60)))
            .await
            .unwrap();

        let range = DateRange::new(now - chrono::Duration::days(1), now);
        services
            .manager
            .create_job(JobData::paginated(ImportFilter::new(range)))
            .unwrap();

        services.janitor_pass(now).await;
        assert!(services.idempotency.get("old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn janitor_prunes_when_idle() {
        let services = services();
        let now = Utc::now();
        services
            .idempotency
            .put(record("old", now - chrono::Duration::days(60)))
            .await
            .unwrap();
        services
            .idempotency
            .put(record("fresh", now - chrono::Duration::days(1)))
            .await
            .unwrap();

        let range = DateRange::new(now - chrono::Duration::days(1), now);
        let id = services
            .manager
            .create_job(JobData::paginated(ImportFilter::new(range)))
            .unwrap();
        services.manager.transition(id, JobStatus::Running).unwrap();
        services.manager.transition(id, JobStatus::Cancelled).unwrap();

        services.janitor_pass(now + chrono::Duration::days(2)).await;

        assert!(services.manager.get_job(id).is_none());
        assert!(services.idempotency.get("old").await.unwrap().is_none());
        assert!(services.idempotency.get("fresh").await.unwrap().is_some());
        assert_eq!(services.config.janitor_interval, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn state_dir_stores_outlive_the_services() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            state_dir: Some(dir.path().to_path_buf()),
            database_url: None,
        };
        let now = Utc::now();
        let range = DateRange::new(now - chrono::Duration::days(1), now);

        let id = {
            let services = AppServices::new(
                Arc::new(ScriptedOrderSource::new(Vec::new())),
                Stores::open(&storage).await.unwrap(),
                ImportConfig::default(),
            );
            let id = services
                .manager
                .create_job(JobData::paginated(ImportFilter::new(range)))
                .unwrap();
            services.manager.transition(id, JobStatus::Running).unwrap();
            id
        };

        let reopened = AppServices::new(
            Arc::new(ScriptedOrderSource::new(Vec::new())),
            Stores::open(&storage).await.unwrap(),
            ImportConfig::default(),
        );
        assert_eq!(reopened.manager.get_job(id).unwrap().status, JobStatus::Running);
        assert!(dir.path().join("jobs").is_dir());
    }
}
