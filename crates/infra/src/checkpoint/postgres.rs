//! Postgres-backed checkpoints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Checkpoint, CheckpointError, CheckpointStore};
use crate::jobs::JobId;

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Database(e.to_string())
    }
}

/// Postgres-backed checkpoint store; one row per job.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the checkpoint table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_checkpoints (
                job_id UUID PRIMARY KEY,
                cursor TEXT,
                processed_count BIGINT NOT NULL,
                last_processed_id TEXT,
                bulk_operation_id TEXT,
                saved_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO import_checkpoints (
                job_id,
                cursor,
                processed_count,
                last_processed_id,
                bulk_operation_id,
                saved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id)
            DO UPDATE SET
                cursor = EXCLUDED.cursor,
                processed_count = EXCLUDED.processed_count,
                last_processed_id = EXCLUDED.last_processed_id,
                bulk_operation_id = EXCLUDED.bulk_operation_id,
                saved_at = EXCLUDED.saved_at
            "#,
        )
        .bind(*checkpoint.job_id.as_uuid())
        .bind(&checkpoint.cursor)
        .bind(checkpoint.processed_count as i64)
        .bind(&checkpoint.last_processed_id)
        .bind(&checkpoint.bulk_operation_id)
        .bind(checkpoint.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT cursor, processed_count, last_processed_id, bulk_operation_id, saved_at
            FROM import_checkpoints
            WHERE job_id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            job_id,
            cursor: row.try_get("cursor")?,
            processed_count: row.try_get::<i64, _>("processed_count")?.max(0) as u64,
            last_processed_id: row.try_get("last_processed_id")?,
            bulk_operation_id: row.try_get("bulk_operation_id")?,
            timestamp: row.try_get::<DateTime<Utc>, _>("saved_at")?,
        }))
    }

    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError> {
        let id: Uuid = job_id.into();
        sqlx::query("DELETE FROM import_checkpoints WHERE job_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
