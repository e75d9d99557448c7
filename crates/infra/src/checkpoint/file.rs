//! File-backed checkpoints: one JSON document per job, replaced atomically.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Checkpoint, CheckpointError, CheckpointStore};
use crate::jobs::JobId;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(checkpoint.job_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        // Write-then-rename so a crash never leaves a torn checkpoint.
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %checkpoint.job_id, processed = checkpoint.processed_count, "checkpoint saved");
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        match tokio::fs::read(self.path_for(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopening_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let id = JobId::new();

        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            let mut cp = Checkpoint::new(id);
            cp.cursor = Some("eyJsYXN0X2lkIjo0MjB9".into());
            cp.processed_count = 500;
            cp.last_processed_id = Some("420".into());
            store.save(&cp).await.unwrap();
        }

        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let cp = store.get(id).await.unwrap().unwrap();
        assert_eq!(cp.processed_count, 500);
        assert_eq!(cp.last_processed_id.as_deref(), Some("420"));
    }

    #[tokio::test]
    async fn missing_checkpoint_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("nested")).await.unwrap();
        assert!(store.get(JobId::new()).await.unwrap().is_none());
        store.clear(JobId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let id = JobId::new();
        store.save(&Checkpoint::new(id)).await.unwrap();
        store.clear(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
