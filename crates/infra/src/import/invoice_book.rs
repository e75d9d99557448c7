//! Local invoice store fed by imports.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use ordersync_core::{DomainError, InvoiceId};
use ordersync_invoicing::InvoiceDraft;

use super::mapping::{MappingError, invoice_command};
use crate::upstream::OrderRecord;

/// Why an order could not be applied locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invoice store unavailable")]
    Unavailable,
    #[error("invoice log write failed: {0}")]
    Log(String),
}

impl From<std::io::Error> for ApplyError {
    fn from(e: std::io::Error) -> Self {
        ApplyError::Log(e.to_string())
    }
}

impl From<serde_json::Error> for ApplyError {
    fn from(e: serde_json::Error) -> Self {
        ApplyError::Log(e.to_string())
    }
}

impl<T> From<PoisonError<T>> for ApplyError {
    fn from(_: PoisonError<T>) -> Self {
        ApplyError::Unavailable
    }
}

/// The local side effect of importing one order.
#[async_trait]
pub trait OrderApplier: Send + Sync {
    async fn apply(&self, order: &OrderRecord) -> Result<InvoiceId, ApplyError>;
}

/// Invoice book, in memory or backed by an append-only JSON-lines log.
///
/// A durable book must outlive restarts for as long as the idempotency
/// records that point at its invoices.
#[derive(Debug, Default)]
pub struct InvoiceBook {
    invoices: RwLock<HashMap<InvoiceId, InvoiceDraft>>,
    log: Option<PathBuf>,
    writer: tokio::sync::Mutex<()>,
}

impl InvoiceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the log at `path` (missing file = empty book); new invoices are
    /// appended to it. A torn trailing line is dropped from the file.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut invoices = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for (n, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<InvoiceDraft>(line) {
                        Ok(draft) => {
                            invoices.insert(draft.id, draft);
                        }
                        Err(e) => warn!(line = n + 1, error = %e, "skipping unreadable invoice"),
                    }
                }
                if !text.is_empty() && !text.ends_with('\n') {
                    let keep = text.rfind('\n').map_or(0, |i| i + 1);
                    tokio::fs::write(&path, &text[..keep]).await?;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(Self {
            invoices: RwLock::new(invoices),
            log: Some(path),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, id: InvoiceId) -> Option<InvoiceDraft> {
        self.read().get(&id).cloned()
    }

    /// All invoices, by upstream order number.
    pub fn list(&self) -> Vec<InvoiceDraft> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|i| (i.external_order_number, *i.id.as_uuid()));
        all
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Invoices created for one upstream order.
    pub fn find_by_order(&self, external_order_id: &str) -> Vec<InvoiceDraft> {
        self.read()
            .values()
            .filter(|i| i.external_order_id == external_order_id)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<InvoiceId, InvoiceDraft>> {
        self.invoices.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OrderApplier for InvoiceBook {
    async fn apply(&self, order: &OrderRecord) -> Result<InvoiceId, ApplyError> {
        let command = invoice_command(order, Utc::now())?;
        let draft = InvoiceDraft::issue_from_order(InvoiceId::new(), &command)?;
        let id = draft.id;
        if let Some(path) = &self.log {
            let mut line = serde_json::to_vec(&draft)?;
            line.push(b'\n');
            let _write = self.writer.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(&line).await?;
            file.sync_data().await?;
        }
        self.invoices.write()?.insert(id, draft);
        Ok(id)
    }
}
