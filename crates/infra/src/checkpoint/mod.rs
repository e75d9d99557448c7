//! Import checkpoints.
//!
//! A checkpoint records how far a job got: the upstream cursor, the number of
//! records processed, and the remote bulk-operation handle. There is at most
//! one per job; each save replaces the previous one. Checkpoints are cleared
//! when a job completes and kept when it fails or is cancelled, so a later
//! run can continue from them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::JobId;

mod file;
#[cfg(feature = "postgres")]
mod postgres;

pub use file::FileCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;

/// Resume point of an import job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: JobId,
    /// Opaque upstream page token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Records handled so far. Bulk jobs count result units (orders), in
    /// the order they appear in the export, so resuming skips a prefix.
    pub processed_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            cursor: None,
            processed_count: 0,
            last_processed_id: None,
            bulk_operation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// The same resume point, owned by another job.
    pub fn reassigned(&self, job_id: JobId) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// Checkpoint persistence error.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("checkpoint database error: {0}")]
    Database(String),
    #[error("checkpoint store lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for CheckpointError {
    fn from(_: PoisonError<T>) -> Self {
        CheckpointError::Poisoned
    }
}

/// Durable per-job resume points.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the job's checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Remove the job's checkpoint; a missing one is not an error.
    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<JobId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()?
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read()?.get(&job_id).cloned())
    }

    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError> {
        self.checkpoints.write()?.remove(&job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_replaces_previous_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let id = JobId::new();

        let mut cp = Checkpoint::new(id);
        cp.cursor = Some("page-2".into());
        cp.processed_count = 250;
        store.save(&cp).await.unwrap();

        cp.cursor = Some("page-3".into());
        cp.processed_count = 500;
        store.save(&cp).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor.as_deref(), Some("page-3"));
        assert_eq!(loaded.processed_count, 500);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        let id = JobId::new();
        store.save(&Checkpoint::new(id)).await.unwrap();
        store.clear(id).await.unwrap();
        store.clear(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[test]
    fn reassigned_keeps_the_resume_point() {
        let mut cp = Checkpoint::new(JobId::new());
        cp.cursor = Some("abc".into());
        cp.processed_count = 7;
        let other = JobId::new();
        let moved = cp.reassigned(other);
        assert_eq!(moved.job_id, other);
        assert_eq!(moved.cursor, cp.cursor);
        assert_eq!(moved.processed_count, 7);
    }

    #[test]
    fn serialises_camel_case() {
        let cp = Checkpoint::new(JobId::new());
        let json = serde_json::to_value(&cp).unwrap();
        assert!(json.get("processedCount").is_some());
        assert!(json.get("cursor").is_none());
    }
}
