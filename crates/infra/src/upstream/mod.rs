//! Upstream commerce API: request/response types and the client seam.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ordersync_core::UpstreamFilter;

use crate::retry::Transient;

pub mod model;
pub mod shopify;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use model::{Address, Customer, LineItem, OrderRecord};
pub use shopify::ShopifyClient;

/// Largest page the orders endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 250;

/// One page request.
///
/// A follow-up request carries only the opaque cursor and the page size; the
/// upstream rejects filters alongside a cursor, so the type cannot hold both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    First { filter: UpstreamFilter, limit: u32 },
    Next { cursor: String, limit: u32 },
}

impl PageRequest {
    pub fn limit(&self) -> u32 {
        match self {
            PageRequest::First { limit, .. } | PageRequest::Next { limit, .. } => *limit,
        }
    }
}

/// What the upstream said about the page after this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageInfo {
    /// Cursor for the next page.
    Next(String),
    /// Pagination metadata present, no next page.
    Last,
    /// No pagination metadata at all.
    Unknown,
}

/// A page of raw order documents. Records are parsed one by one so a single
/// malformed order does not sink the page.
#[derive(Debug, Clone)]
pub struct OrderPage {
    pub orders: Vec<serde_json::Value>,
    pub page_info: PageInfo,
}

/// Remote bulk operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkStatus {
    Created,
    Running,
    Completed,
    Canceling,
    Canceled,
    Failed,
    Expired,
}

impl BulkStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            BulkStatus::Created | BulkStatus::Running | BulkStatus::Canceling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BulkStatus::Created => "CREATED",
            BulkStatus::Running => "RUNNING",
            BulkStatus::Completed => "COMPLETED",
            BulkStatus::Canceling => "CANCELING",
            BulkStatus::Canceled => "CANCELED",
            BulkStatus::Failed => "FAILED",
            BulkStatus::Expired => "EXPIRED",
        }
    }
}

/// Snapshot of a remote bulk export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperation {
    pub id: String,
    pub status: BulkStatus,
    pub error_code: Option<String>,
    pub object_count: u64,
    /// Result file; absent until completed, and absent when nothing matched.
    pub url: Option<String>,
}

/// Upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream connection failed: {0}")]
    Connection(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("could not decode upstream response: {0}")]
    Decode(String),
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
}

impl Transient for UpstreamError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. } | UpstreamError::Timeout | UpstreamError::Connection(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() || e.is_body() {
            UpstreamError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            UpstreamError::Connection(e.to_string())
        }
    }
}

/// Read access to upstream orders.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError>;

    /// Number of orders matching `filter`.
    async fn count_orders(&self, filter: &UpstreamFilter) -> Result<u64, UpstreamError>;

    /// Start an asynchronous export of every order matching `search_query`.
    async fn submit_bulk_export(&self, search_query: &str) -> Result<BulkOperation, UpstreamError>;

    async fn bulk_operation(&self, id: &str) -> Result<BulkOperation, UpstreamError>;

    /// Fetch a completed export's JSON-lines body.
    async fn download(&self, url: &str) -> Result<String, UpstreamError>;
}
