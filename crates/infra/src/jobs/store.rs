//! Job storage implementations.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{info, warn};

use super::types::{Job, JobId};

/// Job store abstraction.
///
/// Stores hand out snapshots; all mutation goes through [`JobStore::modify`]
/// so an implementation can serialise writers per job.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a snapshot of a job.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Mutate a job in place and return the updated snapshot.
    /// Returns `Ok(None)` for unknown ids.
    fn modify(
        &self,
        job_id: JobId,
        f: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, JobStoreError>;

    /// Most recent jobs first.
    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Remove every job matching `predicate`; returns how many were removed.
    fn remove_where(&self, predicate: &dyn Fn(&Job) -> bool) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<PoisonError<T>> for JobStoreError {
    fn from(_: PoisonError<T>) -> Self {
        JobStoreError::Storage("job store lock poisoned".to_string())
    }
}

impl From<std::io::Error> for JobStoreError {
    fn from(e: std::io::Error) -> Self {
        JobStoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for JobStoreError {
    fn from(e: serde_json::Error) -> Self {
        JobStoreError::Storage(e.to_string())
    }
}

type JobCell = Arc<RwLock<Job>>;

/// In-memory job store.
///
/// The outer map is only locked to insert or look up a job; each job is then
/// mutated under its own lock, so writers to different jobs never contend.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobCell>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn cell(&self, job_id: JobId) -> Result<Option<JobCell>, JobStoreError> {
        Ok(self.jobs.read()?.get(&job_id).cloned())
    }

    fn cells(&self) -> Result<Vec<JobCell>, JobStoreError> {
        Ok(self.jobs.read()?.values().cloned().collect())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, Arc::new(RwLock::new(job)));
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.cell(job_id)? {
            Some(cell) => Ok(Some(cell.read()?.clone())),
            None => Ok(None),
        }
    }

    fn modify(
        &self,
        job_id: JobId,
        f: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, JobStoreError> {
        let Some(cell) = self.cell(job_id)? else {
            return Ok(None);
        };
        let mut job = cell.write()?;
        f(&mut *job);
        Ok(Some(job.clone()))
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut result = Vec::new();
        for cell in self.cells()? {
            result.push(cell.read()?.clone());
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn remove_where(&self, predicate: &dyn Fn(&Job) -> bool) -> Result<usize, JobStoreError> {
        let mut doomed = Vec::new();
        for (id, cell) in self.jobs.read()?.iter() {
            if predicate(&*cell.read()?) {
                doomed.push(*id);
            }
        }
        let mut jobs = self.jobs.write()?;
        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len())
    }
}

/// One JSON file per job under a directory, mirrored in memory.
///
/// Every mutation is written through while the job's own lock is held, so
/// the file never lags behind a snapshot another caller has already seen.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    inner: InMemoryJobStore,
}

impl FileJobStore {
    /// Load every job file under `dir`, creating the directory if needed.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let inner = InMemoryJobStore::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let job = match fs::read(&path)
                .map_err(JobStoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<Job>(&bytes)?))
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job file");
                    continue;
                }
            };
            inner.insert(job)?;
        }
        info!(dir = %dir.display(), jobs = inner.jobs.read()?.len(), "job store opened");

        Ok(Self { dir, inner })
    }

    pub fn arc(dir: impl AsRef<Path>) -> Result<Arc<Self>, JobStoreError> {
        Self::open(dir).map(Arc::new)
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    fn write(&self, job: &Job) -> Result<(), JobStoreError> {
        let path = self.path_for(job.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(job)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        match fs::remove_file(self.path_for(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        if self.inner.cell(job.id)?.is_some() {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        self.write(&job)?;
        self.inner.insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id)
    }

    fn modify(
        &self,
        job_id: JobId,
        f: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, JobStoreError> {
        let Some(cell) = self.inner.cell(job_id)? else {
            return Ok(None);
        };
        let mut job = cell.write()?;
        let mut next = job.clone();
        f(&mut next);
        self.write(&next)?;
        *job = next;
        Ok(Some(job.clone()))
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list(limit)
    }

    fn remove_where(&self, predicate: &dyn Fn(&Job) -> bool) -> Result<usize, JobStoreError> {
        let removed = Mutex::new(Vec::new());
        let count = self.inner.remove_where(&|job| {
            let hit = predicate(job);
            if hit {
                removed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(job.id);
            }
            hit
        })?;
        for id in removed.into_inner().unwrap_or_else(PoisonError::into_inner) {
            self.delete(id)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobData, JobStatus};
    use chrono::{Duration, TimeZone, Utc};
    use ordersync_core::{DateRange, ImportFilter};

    fn job_at(minutes: i64) -> Job {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        Job::new(
            JobData::paginated(ImportFilter::new(DateRange::new(t, t))),
            t,
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = InMemoryJobStore::new();
        let job = job_at(0);
        let id = store.insert(job.clone()).unwrap();
        assert_eq!(store.get(id).unwrap(), Some(job));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = job_at(0);
        store.insert(job.clone()).unwrap();
        assert!(matches!(
            store.insert(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn modify_unknown_job_is_none() {
        let store = InMemoryJobStore::new();
        let out = store
            .modify(JobId::new(), &mut |j| j.status = JobStatus::Running)
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn modify_returns_updated_snapshot() {
        let store = InMemoryJobStore::new();
        let id = store.insert(job_at(0)).unwrap();
        let updated = store
            .modify(id, &mut |j| j.results.imported = 7)
            .unwrap()
            .unwrap();
        assert_eq!(updated.results.imported, 7);
        assert_eq!(store.get(id).unwrap().unwrap().results.imported, 7);
    }

    #[test]
    fn list_is_most_recent_first_and_bounded() {
        let store = InMemoryJobStore::new();
        let old = store.insert(job_at(0)).unwrap();
        let mid = store.insert(job_at(5)).unwrap();
        let new = store.insert(job_at(10)).unwrap();

        let ids: Vec<_> = store.list(10).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![new, mid, old]);
        assert_eq!(store.list(2).unwrap().len(), 2);
    }

    #[test]
    fn remove_where_drops_matching_jobs() {
        let store = InMemoryJobStore::new();
        let keep = store.insert(job_at(0)).unwrap();
        let drop = store.insert(job_at(1)).unwrap();
        store
            .modify(drop, &mut |j| j.status = JobStatus::Completed)
            .unwrap();

        let removed = store.remove_where(&|j| j.status.is_terminal()).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(drop).unwrap().is_none());
        assert!(store.get(keep).unwrap().is_some());
    }

    #[test]
    fn file_store_reloads_jobs_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let running;
        {
            let store = FileJobStore::open(dir.path()).unwrap();
            running = store.insert(job_at(0)).unwrap();
            store
                .modify(running, &mut |j| {
                    j.status = JobStatus::Running;
                    j.results.imported = 42;
                })
                .unwrap();
            store.insert(job_at(5)).unwrap();
        }

        let reopened = FileJobStore::open(dir.path()).unwrap();
        let job = reopened.get(running).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.results.imported, 42);
        assert_eq!(reopened.list(10).unwrap().len(), 2);
        assert!(matches!(
            reopened.insert(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn file_store_remove_where_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        let keep = store.insert(job_at(0)).unwrap();
        let done = store.insert(job_at(1)).unwrap();
        store
            .modify(done, &mut |j| j.status = JobStatus::Completed)
            .unwrap();

        assert_eq!(store.remove_where(&|j| j.status.is_terminal()).unwrap(), 1);
        assert!(!dir.path().join(format!("{done}.json")).exists());

        let reopened = FileJobStore::open(dir.path()).unwrap();
        assert!(reopened.get(done).unwrap().is_none());
        assert!(reopened.get(keep).unwrap().is_some());
    }

    #[test]
    fn file_store_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = FileJobStore::open(dir.path()).unwrap();
        assert!(store.list(10).unwrap().is_empty());
    }
}
