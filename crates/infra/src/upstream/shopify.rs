//! reqwest-backed client for the Shopify Admin API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::debug;

use ordersync_core::UpstreamFilter;

use super::{
    BulkOperation, BulkStatus, MAX_PAGE_SIZE, OrderPage, OrderSource, PageInfo, PageRequest,
    UpstreamError,
};
use crate::config::UpstreamConfig;

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const CLIENT_USER_AGENT: &str = concat!("ordersync/", env!("CARGO_PKG_VERSION"));

/// Fields requested from the REST orders endpoint.
const ORDER_FIELDS: &str = "id,order_number,name,email,created_at,updated_at,total_price,\
total_tax,currency,financial_status,fulfillment_status,line_items,customer,billing_address,\
shipping_address";

/// Longest error body kept in an [`UpstreamError::Http`].
const MAX_ERROR_BODY: usize = 500;

const RUN_BULK_EXPORT: &str = r#"
mutation runBulkExport($query: String!) {
  bulkOperationRunQuery(query: $query) {
    bulkOperation { id status }
    userErrors { field message }
  }
}
"#;

const BULK_OPERATION_STATUS: &str = r#"
query bulkOperationStatus($id: ID!) {
  node(id: $id) {
    ... on BulkOperation { id status errorCode objectCount url }
  }
}
"#;

/// The export query run by a bulk operation, restricted by `search`.
pub fn bulk_orders_query(search: &str) -> String {
    let search = search.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"{{
  orders(query: "{search}") {{
    edges {{
      node {{
        id
        name
        email
        createdAt
        updatedAt
        currencyCode
        totalPriceSet {{ shopMoney {{ amount currencyCode }} }}
        totalTaxSet {{ shopMoney {{ amount currencyCode }} }}
        displayFinancialStatus
        displayFulfillmentStatus
        customer {{ id firstName lastName email phone }}
        billingAddress {{ firstName lastName company address1 address2 city zip country countryCodeV2 }}
        shippingAddress {{ firstName lastName company address1 address2 city zip country countryCodeV2 }}
        lineItems {{
          edges {{
            node {{
              id
              title
              quantity
              originalUnitPriceSet {{ shopMoney {{ amount currencyCode }} }}
            }}
          }}
        }}
      }}
    }}
  }}
}}"#
    )
}

/// Shopify Admin API client.
#[derive(Clone)]
pub struct ShopifyClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl std::fmt::Debug for ShopifyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyClient")
            .field("base_url", &self.base_url.as_str())
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl ShopifyClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&config.admin_base_url())
            .map_err(|e| UpstreamError::Rejected(format!("invalid shop url: {e}")))?;
        Self::with_base_url(base_url, config.access_token.clone(), config.request_timeout)
    }

    /// Point the client at an arbitrary admin API root (ending in `/`).
    pub fn with_base_url(
        base_url: Url,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            access_token: access_token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(path)
            .map_err(|e| UpstreamError::Rejected(format!("failed to build {path} url: {e}")))
    }

    /// Map non-success responses onto [`UpstreamError`].
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("unable to read error body"));
        Err(UpstreamError::Http {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        })
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, UpstreamError> {
        let response = self
            .http
            .post(self.endpoint("graphql.json")?)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let envelope: GraphQlResponse<T> = Self::check(response).await?.json().await?;

        if !envelope.errors.is_empty() {
            let throttled = envelope.errors.iter().any(|e| {
                e.extensions
                    .as_ref()
                    .and_then(|x| x.get("code"))
                    .and_then(|c| c.as_str())
                    == Some("THROTTLED")
            });
            if throttled {
                return Err(UpstreamError::RateLimited { retry_after: None });
            }
            let messages: Vec<_> = envelope.errors.into_iter().map(|e| e.message).collect();
            return Err(UpstreamError::Rejected(messages.join("; ")));
        }
        envelope
            .data
            .ok_or_else(|| UpstreamError::Decode("graphql response without data".into()))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Read pagination state from `Link` headers.
fn page_info(headers: &HeaderMap) -> PageInfo {
    let mut saw_link = false;
    for value in headers.get_all(LINK) {
        saw_link = true;
        if let Some(cursor) = value.to_str().ok().and_then(next_page_info) {
            return PageInfo::Next(cursor);
        }
    }
    if saw_link { PageInfo::Last } else { PageInfo::Unknown }
}

/// Extract `page_info` from the `rel="next"` entry of a `Link` header.
pub(crate) fn next_page_info(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| matches!(p.trim(), r#"rel="next""# | "rel=next"));
        if !is_next {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page_info")
            .map(|(_, v)| v.into_owned())
    })
}

#[derive(Deserialize)]
struct OrdersEnvelope {
    orders: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CountEnvelope {
    count: u64,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBulkExportData {
    bulk_operation_run_query: Option<RunBulkExportPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBulkExportPayload {
    bulk_operation: Option<BulkOperationNode>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
struct UserError {
    #[serde(default)]
    field: Option<Vec<String>>,
    message: String,
}

#[derive(Deserialize)]
struct NodeData {
    node: Option<BulkOperationNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkOperationNode {
    id: String,
    status: BulkStatus,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    object_count: u64,
    #[serde(default)]
    url: Option<String>,
}

impl From<BulkOperationNode> for BulkOperation {
    fn from(node: BulkOperationNode) -> Self {
        BulkOperation {
            id: node.id,
            status: node.status,
            error_code: node.error_code,
            object_count: node.object_count,
            url: node.url,
        }
    }
}

/// Counts are serialised as strings by the GraphQL API.
fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
        Null(()),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Null(()) => Ok(0),
    }
}

#[async_trait]
impl OrderSource for ShopifyClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        let mut url = self.endpoint("orders.json")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &request.limit().clamp(1, MAX_PAGE_SIZE).to_string());
            match request {
                PageRequest::First { filter, .. } => {
                    for (key, value) in filter.to_query_pairs() {
                        query.append_pair(key, &value);
                    }
                    query.append_pair("fields", ORDER_FIELDS);
                }
                PageRequest::Next { cursor, .. } => {
                    query.append_pair("page_info", cursor);
                }
            }
        }
        debug!(path = url.path(), "fetching order page");

        let response = self
            .http
            .get(url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let page_info = page_info(response.headers());
        let body: OrdersEnvelope = response.json().await?;

        Ok(OrderPage {
            orders: body.orders,
            page_info,
        })
    }

    async fn count_orders(&self, filter: &UpstreamFilter) -> Result<u64, UpstreamError> {
        let mut url = self.endpoint("orders/count.json")?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in filter.to_query_pairs() {
                if key != "since_id" {
                    query.append_pair(key, &value);
                }
            }
        }
        let response = self
            .http
            .get(url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .send()
            .await?;
        let body: CountEnvelope = Self::check(response).await?.json().await?;
        Ok(body.count)
    }

    async fn submit_bulk_export(&self, search_query: &str) -> Result<BulkOperation, UpstreamError> {
        let data: RunBulkExportData = self
            .graphql(
                RUN_BULK_EXPORT,
                json!({ "query": bulk_orders_query(search_query) }),
            )
            .await?;
        let payload = data
            .bulk_operation_run_query
            .ok_or_else(|| UpstreamError::Decode("missing bulkOperationRunQuery".into()))?;

        if !payload.user_errors.is_empty() {
            let messages: Vec<_> = payload
                .user_errors
                .into_iter()
                .map(|e| match e.field {
                    Some(field) if !field.is_empty() => format!("{}: {}", field.join("."), e.message),
                    _ => e.message,
                })
                .collect();
            return Err(UpstreamError::Rejected(messages.join("; ")));
        }

        payload
            .bulk_operation
            .map(BulkOperation::from)
            .ok_or_else(|| UpstreamError::Rejected("no bulk operation was started".into()))
    }

    async fn bulk_operation(&self, id: &str) -> Result<BulkOperation, UpstreamError> {
        let data: NodeData = self
            .graphql(BULK_OPERATION_STATUS, json!({ "id": id }))
            .await?;
        data.node
            .map(BulkOperation::from)
            .ok_or_else(|| UpstreamError::Rejected(format!("unknown bulk operation {id}")))
    }

    async fn download(&self, url: &str) -> Result<String, UpstreamError> {
        let url = Url::parse(url).map_err(|e| UpstreamError::Rejected(format!("invalid result url: {e}")))?;
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ordersync_core::filters::FinancialStatus;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API_ROOT: &str = "/admin/api/2025-10/";

    fn client(server: &MockServer) -> ShopifyClient {
        let base = Url::parse(&format!("{}{API_ROOT}", server.uri())).unwrap();
        ShopifyClient::with_base_url(base, "shpat_test", Duration::from_secs(5)).unwrap()
    }

    fn filter() -> UpstreamFilter {
        UpstreamFilter {
            created_at_min: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            financial_status: Some(FinancialStatus::Paid),
            ..UpstreamFilter::default()
        }
    }

    #[test]
    fn next_page_info_reads_the_next_link_only() {
        let link = r#"<https://shop.example/admin/api/2025-10/orders.json?limit=250&page_info=prev123>; rel="previous", <https://shop.example/admin/api/2025-10/orders.json?limit=250&page_info=next456>; rel="next""#;
        assert_eq!(next_page_info(link).as_deref(), Some("next456"));

        let only_prev = r#"<https://shop.example/orders.json?page_info=prev123>; rel="previous""#;
        assert_eq!(next_page_info(only_prev), None);
    }

    #[test]
    fn bulk_query_escapes_quotes() {
        let q = bulk_orders_query(r#"created_at:>='2024-05-01' AND "x""#);
        assert!(q.contains(r#"orders(query: "created_at:>='2024-05-01' AND \"x\"")"#));
    }

    #[tokio::test]
    async fn first_page_sends_filter_and_token_and_reads_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API_ROOT}orders.json")))
            .and(header(ACCESS_TOKEN_HEADER, "shpat_test"))
            .and(query_param("limit", "250"))
            .and(query_param("financial_status", "paid"))
            .and(query_param("status", "any"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "Link",
                        format!(r#"<{}{API_ROOT}orders.json?limit=250&page_info=abc>; rel="next""#, server.uri()).as_str(),
                    )
                    .set_body_json(json!({ "orders": [{ "id": 1 }, { "id": 2 }] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_page(&PageRequest::First {
                filter: filter(),
                limit: 250,
            })
            .await
            .unwrap();

        assert_eq!(page.orders.len(), 2);
        assert_eq!(page.page_info, PageInfo::Next("abc".into()));
    }

    #[tokio::test]
    async fn cursor_requests_carry_only_limit_and_page_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API_ROOT}orders.json")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", r#"<https://x.example/orders.json?page_info=abc>; rel="previous""#)
                    .set_body_json(json!({ "orders": [] })),
            )
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_page(&PageRequest::Next {
                cursor: "abc".into(),
                limit: 500,
            })
            .await
            .unwrap();
        assert_eq!(page.page_info, PageInfo::Last);

        let requests = server.received_requests().await.unwrap();
        let keys: Vec<String> = requests[0]
            .url
            .query_pairs()
            .map(|(k, _)| k.into_owned())
            .collect();
        assert_eq!(keys, vec!["limit", "page_info"]);
        assert!(requests[0].url.query().unwrap().contains("limit=250"));
    }

    #[tokio::test]
    async fn missing_link_header_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API_ROOT}orders.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "orders": [] })))
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_page(&PageRequest::First {
                filter: UpstreamFilter::default(),
                limit: 50,
            })
            .await
            .unwrap();
        assert_eq!(page.page_info, PageInfo::Unknown);
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2.0"))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_page(&PageRequest::Next {
                cursor: "c".into(),
                limit: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[tokio::test]
    async fn server_errors_are_permanent_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .count_orders(&filter())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Http {
                status: 500,
                body: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn count_reads_the_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API_ROOT}orders/count.json")))
            .and(query_param("status", "any"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 1234 })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).count_orders(&filter()).await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn bulk_submit_surfaces_user_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{API_ROOT}graphql.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "bulkOperationRunQuery": {
                        "bulkOperation": null,
                        "userErrors": [{ "field": ["query"], "message": "A bulk operation is already running" }]
                    }
                }
            })))
            .mount(&server)
            .await;

        let err = client(&server).submit_bulk_export("").await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Rejected("query: A bulk operation is already running".into())
        );
    }

    #[tokio::test]
    async fn bulk_status_parses_string_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{API_ROOT}graphql.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "node": {
                        "id": "gid://shopify/BulkOperation/1",
                        "status": "COMPLETED",
                        "errorCode": null,
                        "objectCount": "5032",
                        "url": "https://storage.example/result.jsonl"
                    }
                }
            })))
            .mount(&server)
            .await;

        let op = client(&server)
            .bulk_operation("gid://shopify/BulkOperation/1")
            .await
            .unwrap();
        assert_eq!(op.status, BulkStatus::Completed);
        assert_eq!(op.object_count, 5032);
        assert_eq!(op.url.as_deref(), Some("https://storage.example/result.jsonl"));
    }

    #[tokio::test]
    async fn throttled_graphql_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "message": "Throttled", "extensions": { "code": "THROTTLED" } }]
            })))
            .mount(&server)
            .await;

        let err = client(&server).bulk_operation("x").await.unwrap_err();
        assert_eq!(err, UpstreamError::RateLimited { retry_after: None });
    }
}
