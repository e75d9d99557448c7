//! Idempotent side effects keyed by a stable string.
//!
//! The first successful result for a key is persisted; any later call with
//! the same key gets that result back without re-running the effect. Failed
//! attempts persist nothing, so they may be retried.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::jobs::JobId;

/// Key under which the invoice created from an upstream order is recorded.
pub fn order_invoice_key(order_id: &str) -> String {
    format!("create-invoice-from-order:{order_id}")
}

/// First successful result for a key. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub value: serde_json::Value,
    /// Job that produced the record (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("idempotency record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("idempotency store lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for IdempotencyError {
    fn from(_: PoisonError<T>) -> Self {
        IdempotencyError::Poisoned
    }
}

/// Persistence for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Store `record` unless its key already exists; the first write wins.
    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError>;

    /// Drop records created before `cutoff`; returns how many were dropped.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError>;
}

/// In-memory idempotency store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.records.read()?.get(key).cloned())
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        self.records
            .write()?
            .entry(record.key.clone())
            .or_insert(record);
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut records = self.records.write()?;
        let before = records.len();
        records.retain(|_, r| r.created_at >= cutoff);
        Ok(before - records.len())
    }
}

/// Append-only JSON-lines file, mirrored in memory.
///
/// Every accepted record is appended as one line; pruning rewrites the file.
#[derive(Debug)]
pub struct FileIdempotencyStore {
    path: PathBuf,
    records: RwLock<HashMap<String, IdempotencyRecord>>,
    writer: tokio::sync::Mutex<()>,
}

impl FileIdempotencyStore {
    /// Load `path` (missing file = empty store).
    ///
    /// A torn trailing line from an interrupted append is dropped from the file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IdempotencyError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut records = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for (n, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IdempotencyRecord>(line) {
                        Ok(record) => {
                            records.entry(record.key.clone()).or_insert(record);
                        }
                        Err(e) => warn!(line = n + 1, error = %e, "skipping unreadable idempotency record"),
                    }
                }
                if !text.is_empty() && !text.ends_with('\n') {
                    let keep = text.rfind('\n').map_or(0, |i| i + 1);
                    tokio::fs::write(&path, &text[..keep]).await?;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.records.read()?.get(key).cloned())
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        let _write = self.writer.lock().await;
        let exists = self.records.read()?.contains_key(&record.key);
        if exists {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        self.records.write()?.insert(record.key.clone(), record);
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let _write = self.writer.lock().await;
        let (kept, removed) = {
            let records = self.records.read()?;
            let kept: Vec<IdempotencyRecord> = records
                .values()
                .filter(|r| r.created_at >= cutoff)
                .cloned()
                .collect();
            let removed = records.len() - kept.len();
            (kept, removed)
        };
        if removed == 0 {
            return Ok(0);
        }

        let mut body = Vec::new();
        for record in &kept {
            body.extend(serde_json::to_vec(record)?);
            body.push(b'\n');
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        let mut records = self.records.write()?;
        records.retain(|_, r| r.created_at >= cutoff);
        Ok(removed)
    }
}

/// Outcome of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The effect ran now.
    Applied(T),
    /// The effect ran earlier; this is its stored result.
    Replayed(T),
}

impl<T> Guarded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Guarded::Applied(v) | Guarded::Replayed(v) => v,
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, Guarded::Replayed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    /// Another caller is running the effect for the same key.
    #[error("operation for key {0} is already in progress")]
    InFlight(String),
    #[error("{0}")]
    Operation(E),
    #[error(transparent)]
    Store(#[from] IdempotencyError),
}

/// Runs side effects at most once per key.
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    in_flight: Mutex<HashSet<String>>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Run `op` unless `key` already has a recorded result.
    pub async fn with_idempotency<T, E, F, Fut>(
        &self,
        key: &str,
        job_id: JobId,
        op: F,
    ) -> Result<Guarded<T>, GuardError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(record) = self.store.get(key).await? {
            return Ok(Guarded::Replayed(decode(record)?));
        }

        let _marker = self.mark_in_flight(key)?;

        // A concurrent caller may have finished between the lookup and the mark.
        if let Some(record) = self.store.get(key).await? {
            return Ok(Guarded::Replayed(decode(record)?));
        }

        let value = op().await.map_err(GuardError::Operation)?;

        let record = IdempotencyRecord {
            key: key.to_string(),
            value: serde_json::to_value(&value).map_err(IdempotencyError::from)?,
            job_id: Some(job_id),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put(record).await {
            error!(key, error = %e, "side effect applied but not recorded");
            return Err(GuardError::Store(e));
        }
        Ok(Guarded::Applied(value))
    }

    fn mark_in_flight<E>(&self, key: &str) -> Result<InFlightMarker<'_>, GuardError<E>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.to_string()) {
            return Err(GuardError::InFlight(key.to_string()));
        }
        Ok(InFlightMarker {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }
}

fn decode<T: DeserializeOwned>(record: IdempotencyRecord) -> Result<T, IdempotencyError> {
    Ok(serde_json::from_value(record.value)?)
}

/// Clears the in-flight mark on drop, including when the caller is cancelled.
struct InFlightMarker<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightMarker<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard() -> (IdempotencyGuard, Arc<InMemoryIdempotencyStore>) {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        (IdempotencyGuard::new(store.clone()), store)
    }

    #[tokio::test]
    async fn second_call_replays_without_running() {
        let (guard, _) = guard();
        let calls = AtomicU32::new(0);
        let job = JobId::new();

        let first = guard
            .with_idempotency("k", job, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("inv-1".to_string())
            })
            .await
            .unwrap();
        let second = guard
            .with_idempotency("k", job, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("inv-2".to_string())
            })
            .await
            .unwrap();

        assert_eq!(first, Guarded::Applied("inv-1".to_string()));
        assert_eq!(second, Guarded::Replayed("inv-1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_recorded() {
        let (guard, store) = guard();
        let job = JobId::new();

        let err = guard
            .with_idempotency("k", job, || async { Err::<String, _>("upstream said no") })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Operation("upstream said no")));
        assert!(store.is_empty());

        let ok = guard
            .with_idempotency("k", job, || async { Ok::<_, &str>("inv".to_string()) })
            .await
            .unwrap();
        assert!(!ok.is_replayed());
    }

    #[tokio::test]
    async fn concurrent_same_key_is_rejected_in_flight() {
        let (guard, _) = guard();
        let guard = Arc::new(guard);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .with_idempotency("k", JobId::new(), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, String>(1u32)
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let second = guard
            .with_idempotency("k", JobId::new(), || async { Ok::<_, String>(2u32) })
            .await;
        assert!(matches!(second, Err(GuardError::InFlight(k)) if k == "k"));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Guarded::Applied(1));
    }

    #[test]
    fn order_keys_are_namespaced() {
        assert_eq!(order_invoice_key("450789469"), "create-invoice-from-order:450789469");
    }

    #[tokio::test]
    async fn file_store_survives_reopen_and_keeps_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.jsonl");
        let job = JobId::new();

        {
            let store = FileIdempotencyStore::open(&path).await.unwrap();
            for value in ["first", "second"] {
                store
                    .put(IdempotencyRecord {
                        key: "k".into(),
                        value: serde_json::json!(value),
                        job_id: Some(job),
                        created_at: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
        }

        let store = FileIdempotencyStore::open(&path).await.unwrap();
        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.value, serde_json::json!("first"));
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn file_store_skips_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.jsonl");
        let good = serde_json::to_string(&IdempotencyRecord {
            key: "a".into(),
            value: serde_json::json!(1),
            job_id: None,
            created_at: Utc::now(),
        })
        .unwrap();
        std::fs::write(&path, format!("{good}\n{{\"key\":\"b\",\"val")).unwrap();

        let store = FileIdempotencyStore::open(&path).await.unwrap();
        assert_eq!(store.len(), 1);

        store
            .put(IdempotencyRecord {
                key: "c".into(),
                value: serde_json::json!(3),
                job_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let reopened = FileIdempotencyStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_drops_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.jsonl");
        let store = FileIdempotencyStore::open(&path).await.unwrap();
        let now = Utc::now();

        for (key, age_days) in [("old", 40), ("new", 1)] {
            store
                .put(IdempotencyRecord {
                    key: key.into(),
                    value: serde_json::Value::Null,
                    job_id: None,
                    created_at: now - chrono::Duration::days(age_days),
                })
                .await
                .unwrap();
        }

        let removed = store
            .prune_older_than(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("old").await.unwrap().is_none());

        let reopened = FileIdempotencyStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
    }
}
