//! Scripted in-process [`OrderSource`] for tests.
//!
//! Serves a fixed list of raw orders with `cursor-<offset>` page tokens and
//! lets a test inject rate limits, one-shot failures, and stalls at chosen
//! offsets. Bulk exports replay a scripted sequence of statuses.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use ordersync_core::UpstreamFilter;

use super::{
    BulkOperation, BulkStatus, OrderPage, OrderSource, PageInfo, PageRequest, UpstreamError,
};

const BULK_OPERATION_ID: &str = "gid://shopify/BulkOperation/1";
const BULK_RESULT_URL: &str = "memory://bulk/result.jsonl";

#[derive(Default)]
struct Script {
    orders: Vec<Value>,
    link_headers: bool,
    count: Option<u64>,
    fail_count: bool,
    rate_limits: VecDeque<Option<Duration>>,
    failures: HashMap<usize, UpstreamError>,
    stalls: HashMap<usize, Arc<Notify>>,
    page_requests: Vec<PageRequest>,
    bulk_submit_error: Option<UpstreamError>,
    bulk_submissions: Vec<String>,
    bulk_statuses: VecDeque<BulkOperation>,
    bulk_polls: usize,
    bulk_result: Option<String>,
    downloads: usize,
}

/// Deterministic upstream double.
#[derive(Default)]
pub struct ScriptedOrderSource {
    script: Mutex<Script>,
}

impl ScriptedOrderSource {
    /// Serve `orders` in order, with `Link`-style cursors.
    pub fn new(orders: Vec<Value>) -> Self {
        Self {
            script: Mutex::new(Script {
                orders,
                link_headers: true,
                ..Script::default()
            }),
        }
    }

    /// Answer pages without pagination metadata ([`PageInfo::Unknown`]).
    pub fn without_link_headers(self) -> Self {
        self.lock().link_headers = false;
        self
    }

    pub fn with_count(self, count: u64) -> Self {
        self.lock().count = Some(count);
        self
    }

    pub fn with_failing_count(self) -> Self {
        self.lock().fail_count = true;
        self
    }

    /// Body returned by `download` once the export completes.
    pub fn with_bulk_result(self, jsonl: impl Into<String>) -> Self {
        self.lock().bulk_result = Some(jsonl.into());
        self
    }

    /// Statuses returned by successive polls; the last one repeats.
    pub fn with_bulk_statuses(self, statuses: Vec<BulkOperation>) -> Self {
        self.lock().bulk_statuses = statuses.into();
        self
    }

    pub fn with_bulk_submit_error(self, error: UpstreamError) -> Self {
        self.lock().bulk_submit_error = Some(error);
        self
    }

    /// The next `times` page fetches answer 429.
    pub fn rate_limit_next(&self, times: usize, retry_after: Option<Duration>) {
        let mut script = self.lock();
        script.rate_limits.extend(std::iter::repeat_n(retry_after, times));
    }

    /// The next fetch of the page starting at `offset` fails once with `error`.
    pub fn fail_fetch_at(&self, offset: usize, error: UpstreamError) {
        self.lock().failures.insert(offset, error);
    }

    /// The next fetch of the page starting at `offset` never returns.
    ///
    /// The returned handle is notified when the fetch has been entered.
    pub fn stall_fetch_at(&self, offset: usize) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.lock().stalls.insert(offset, notify.clone());
        notify
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.lock().page_requests.clone()
    }

    pub fn bulk_submissions(&self) -> Vec<String> {
        self.lock().bulk_submissions.clone()
    }

    pub fn bulk_polls(&self) -> usize {
        self.lock().bulk_polls
    }

    pub fn downloads(&self) -> usize {
        self.lock().downloads
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn page_offset(script: &Script, request: &PageRequest) -> Result<usize, UpstreamError> {
        match request {
            PageRequest::First { filter, .. } => Ok(match &filter.since_id {
                Some(since) => script
                    .orders
                    .iter()
                    .position(|o| raw_id(o).as_deref() == Some(since.as_str()))
                    .map_or(0, |i| i + 1),
                None => 0,
            }),
            PageRequest::Next { cursor, .. } => cursor
                .strip_prefix("cursor-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| UpstreamError::Http {
                    status: 400,
                    body: format!("invalid page_info {cursor}"),
                }),
        }
    }
}

fn raw_id(order: &Value) -> Option<String> {
    match order.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl OrderSource for ScriptedOrderSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        let stall = {
            let mut script = self.lock();
            script.page_requests.push(request.clone());

            if let Some(retry_after) = script.rate_limits.pop_front() {
                return Err(UpstreamError::RateLimited { retry_after });
            }

            let offset = Self::page_offset(&script, request)?;
            if let Some(error) = script.failures.remove(&offset) {
                return Err(error);
            }
            match script.stalls.remove(&offset) {
                Some(notify) => notify,
                None => {
                    let total = script.orders.len();
                    let start = offset.min(total);
                    let end = (start + request.limit() as usize).min(total);
                    let page_info = if !script.link_headers {
                        PageInfo::Unknown
                    } else if end < total {
                        PageInfo::Next(format!("cursor-{end}"))
                    } else {
                        PageInfo::Last
                    };
                    return Ok(OrderPage {
                        orders: script.orders[start..end].to_vec(),
                        page_info,
                    });
                }
            }
        };

        stall.notify_one();
        std::future::pending().await
    }

    async fn count_orders(&self, _filter: &UpstreamFilter) -> Result<u64, UpstreamError> {
        let script = self.lock();
        if script.fail_count {
            return Err(UpstreamError::Http {
                status: 503,
                body: "count unavailable".into(),
            });
        }
        Ok(script.count.unwrap_or(script.orders.len() as u64))
    }

    async fn submit_bulk_export(&self, search_query: &str) -> Result<BulkOperation, UpstreamError> {
        let mut script = self.lock();
        if let Some(error) = script.bulk_submit_error.take() {
            return Err(error);
        }
        script.bulk_submissions.push(search_query.to_string());
        Ok(bulk_operation(BulkStatus::Created, 0, None))
    }

    async fn bulk_operation(&self, id: &str) -> Result<BulkOperation, UpstreamError> {
        let mut script = self.lock();
        script.bulk_polls += 1;
        let status = if script.bulk_statuses.len() > 1 {
            script.bulk_statuses.pop_front()
        } else {
            script.bulk_statuses.front().cloned()
        };
        let mut status = status.unwrap_or_else(|| {
            let lines = script.bulk_result.as_deref().map_or(0, |r| r.lines().count());
            let url = script.bulk_result.as_ref().map(|_| BULK_RESULT_URL.to_string());
            bulk_operation(BulkStatus::Completed, lines as u64, url)
        });
        status.id = id.to_string();
        Ok(status)
    }

    async fn download(&self, url: &str) -> Result<String, UpstreamError> {
        let mut script = self.lock();
        script.downloads += 1;
        match (&script.bulk_result, url == BULK_RESULT_URL) {
            (Some(body), true) => Ok(body.clone()),
            _ => Err(UpstreamError::Http {
                status: 404,
                body: format!("no result at {url}"),
            }),
        }
    }
}

/// Build a bulk operation snapshot.
pub fn bulk_operation(status: BulkStatus, object_count: u64, url: Option<String>) -> BulkOperation {
    BulkOperation {
        id: BULK_OPERATION_ID.to_string(),
        status,
        error_code: None,
        object_count,
        url,
    }
}

/// A completed export whose result is served by the fake's `download`.
pub fn completed_bulk_operation(object_count: u64) -> BulkOperation {
    bulk_operation(
        BulkStatus::Completed,
        object_count,
        Some(BULK_RESULT_URL.to_string()),
    )
}

/// A REST order document with one line item.
pub fn sample_order(id: u64) -> Value {
    json!({
        "id": id,
        "order_number": 1000 + id,
        "name": format!("#{}", 1000 + id),
        "email": format!("customer{id}@example.com"),
        "created_at": "2024-05-01T10:00:00+02:00",
        "total_price": "119.00",
        "total_tax": "19.00",
        "currency": "EUR",
        "financial_status": "paid",
        "line_items": [
            { "id": id * 10, "title": "Widget", "quantity": 1, "price": "119.00" }
        ],
        "customer": { "id": 500 + id, "first_name": "Erika", "last_name": "Mustermann" },
        "billing_address": {
            "address1": "Hauptstr. 1",
            "city": "Berlin",
            "zip": "10115",
            "country": "Germany"
        }
    })
}

/// Orders with ids `1..=n`.
pub fn sample_orders(n: u64) -> Vec<Value> {
    (1..=n).map(sample_order).collect()
}

/// Bulk JSONL for `ids`: each order on one line followed by its line item.
pub fn sample_bulk_result(ids: impl IntoIterator<Item = u64>) -> String {
    let mut out = String::new();
    for id in ids {
        let parent = format!("gid://shopify/Order/{id}");
        let order = json!({
            "id": parent,
            "name": format!("#{}", 1000 + id),
            "email": format!("customer{id}@example.com"),
            "createdAt": "2024-05-01T08:00:00Z",
            "currencyCode": "EUR",
            "totalPriceSet": { "shopMoney": { "amount": "119.00", "currencyCode": "EUR" } },
            "totalTaxSet": { "shopMoney": { "amount": "19.00", "currencyCode": "EUR" } },
            "displayFinancialStatus": "PAID",
            "customer": { "id": format!("gid://shopify/Customer/{}", 500 + id), "firstName": "Erika", "lastName": "Mustermann" }
        });
        let line = json!({
            "id": format!("gid://shopify/LineItem/{}", id * 10),
            "title": "Widget",
            "quantity": 1,
            "originalUnitPriceSet": { "shopMoney": { "amount": "119.00", "currencyCode": "EUR" } },
            "__parentId": parent
        });
        out.push_str(&order.to_string());
        out.push('\n');
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
