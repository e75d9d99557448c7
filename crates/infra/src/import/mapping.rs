//! Upstream order documents → [`OrderRecord`] → invoice command.
//!
//! Pure functions; the strategies own all I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use ordersync_invoicing::{InvoiceCustomer, IssueFromOrder, OrderLine};

use crate::upstream::{Address, Customer, LineItem, OrderRecord};

const DEFAULT_COUNTRY: &str = "Deutschland";
const UNKNOWN_CUSTOMER: &str = "Unbekannter Kunde";

/// A record that could not be turned into an invoice command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("malformed order: {0}")]
    Malformed(String),
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
}

/// Parse one REST order document.
pub fn parse_rest_order(value: &Value) -> Result<OrderRecord, MappingError> {
    OrderRecord::deserialize(value).map_err(|e| MappingError::Malformed(e.to_string()))
}

/// Best-effort id of a raw document, for error messages and `since_id`.
pub fn raw_order_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(strip_gid(s).to_string()),
        _ => None,
    }
}

/// `gid://shopify/Order/123` → `123`. Plain ids pass through.
pub fn strip_gid(id: &str) -> &str {
    if id.starts_with("gid://") {
        id.rsplit('/').next().unwrap_or(id)
    } else {
        id
    }
}

/// Amount string in major units → minor units (cents), without floats.
///
/// More than two decimals are rounded half up.
pub fn parse_money(amount: &str) -> Result<u64, MappingError> {
    let invalid = || MappingError::InvalidAmount(amount.to_string());
    let trimmed = amount.trim();
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let digits: Vec<u64> = fraction.bytes().map(|b| u64::from(b - b'0')).collect();
    let cents = digits.first().copied().unwrap_or(0) * 10 + digits.get(1).copied().unwrap_or(0);
    let round_up = u64::from(digits.get(2).is_some_and(|d| *d >= 5));

    whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents + round_up))
        .ok_or_else(invalid)
}

/// Build the invoice command for an order.
pub fn invoice_command(
    order: &OrderRecord,
    issued_at: DateTime<Utc>,
) -> Result<IssueFromOrder, MappingError> {
    let lines = order
        .line_items
        .iter()
        .map(|item| {
            Ok(OrderLine {
                title: item.title.clone(),
                quantity: item.quantity,
                unit_price: parse_money(&item.price)?,
            })
        })
        .collect::<Result<Vec<_>, MappingError>>()?;

    Ok(IssueFromOrder {
        external_order_id: order.id.clone(),
        order_number: order.order_number,
        ordered_at: order.created_at,
        currency: order.currency.clone(),
        customer: invoice_customer(order),
        lines,
        total_amount: parse_money(&order.total_price)?,
        tax_amount: order.total_tax.as_deref().map(parse_money).transpose()?.unwrap_or(0),
        financial_status: order.financial_status.clone(),
        issued_at,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn full_name(first: &Option<String>, last: &Option<String>) -> Option<String> {
    let parts: Vec<&str> = [non_empty(first), non_empty(last)].into_iter().flatten().collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn invoice_customer(order: &OrderRecord) -> InvoiceCustomer {
    let address = order.billing_address.as_ref().or(order.shipping_address.as_ref());
    let customer = order.customer.as_ref();

    let name = customer
        .and_then(|c| full_name(&c.first_name, &c.last_name))
        .or_else(|| address.and_then(|a| full_name(&a.first_name, &a.last_name)))
        .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string());

    let street = address
        .map(|a| {
            [non_empty(&a.address1), non_empty(&a.address2)]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let country = address
        .and_then(|a| non_empty(&a.country))
        .unwrap_or(DEFAULT_COUNTRY)
        .to_string();

    InvoiceCustomer {
        name,
        email: non_empty(&order.email)
            .or_else(|| customer.and_then(|c| non_empty(&c.email)))
            .map(str::to_string),
        phone: customer.and_then(|c| non_empty(&c.phone)).map(str::to_string),
        address: street,
        city: address.and_then(|a| non_empty(&a.city)).unwrap_or_default().to_string(),
        zip_code: address.and_then(|a| non_empty(&a.zip)).unwrap_or_default().to_string(),
        country,
        company_name: address.and_then(|a| non_empty(&a.company)).map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Bulk export documents
// ---------------------------------------------------------------------------

/// One order reassembled from the bulk JSONL result.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUnit {
    /// 1-based line number of the unit's last line.
    pub end_line: u64,
    pub node: Result<Value, String>,
}

/// Group JSONL lines into orders.
///
/// Nested connection rows (`__parentId`) are folded back into their parent's
/// `lineItems.edges`. A row whose parent is unknown becomes a failed unit.
pub fn group_bulk_lines(body: &str) -> Vec<BulkUnit> {
    let mut units: Vec<BulkUnit> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (idx, line) in body.lines().enumerate() {
        let line_no = idx as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                units.push(BulkUnit {
                    end_line: line_no,
                    node: Err(format!("line {line_no}: invalid JSON: {e}")),
                });
                continue;
            }
        };

        let parent = value
            .as_object_mut()
            .and_then(|o| o.remove("__parentId"))
            .and_then(|p| p.as_str().map(str::to_string));

        match parent {
            Some(parent_id) => match by_id.get(&parent_id).copied() {
                Some(index) => {
                    let unit = &mut units[index];
                    unit.end_line = line_no;
                    if let Ok(parent) = &mut unit.node {
                        attach_child(parent, value);
                    }
                }
                None => units.push(BulkUnit {
                    end_line: line_no,
                    node: Err(format!("line {line_no}: unknown parent {parent_id}")),
                }),
            },
            None => {
                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    by_id.insert(id.to_string(), units.len());
                }
                units.push(BulkUnit {
                    end_line: line_no,
                    node: Ok(value),
                });
            }
        }
    }
    units
}

fn attach_child(parent: &mut Value, child: Value) {
    let Some(object) = parent.as_object_mut() else {
        return;
    };
    let line_items = object
        .entry("lineItems")
        .or_insert_with(|| serde_json::json!({ "edges": [] }));
    if let Some(edges) = line_items
        .as_object_mut()
        .map(|o| o.entry("edges").or_insert_with(|| Value::Array(Vec::new())))
        .and_then(Value::as_array_mut)
    {
        edges.push(serde_json::json!({ "node": child }));
    }
}

/// Decimal scalars arrive as strings; tolerate bare numbers.
fn decimal_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected amount, got {other}"))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Money {
    #[serde(deserialize_with = "decimal_string")]
    amount: String,
    #[serde(default)]
    currency_code: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyBag {
    shop_money: Money,
}

#[derive(Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

#[derive(Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkLineItem {
    #[serde(default)]
    id: Option<String>,
    title: String,
    quantity: i64,
    #[serde(default)]
    original_unit_price_set: Option<MoneyBag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkCustomer {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkAddress {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    address1: Option<String>,
    #[serde(default)]
    address2: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    zip: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code_v2: Option<String>,
}

impl From<BulkAddress> for Address {
    fn from(a: BulkAddress) -> Self {
        Address {
            first_name: a.first_name,
            last_name: a.last_name,
            company: a.company,
            address1: a.address1,
            address2: a.address2,
            city: a.city,
            zip: a.zip,
            country: a.country,
            country_code: a.country_code_v2,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkOrder {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    currency_code: Option<String>,
    total_price_set: MoneyBag,
    #[serde(default)]
    total_tax_set: Option<MoneyBag>,
    #[serde(default)]
    display_financial_status: Option<String>,
    #[serde(default)]
    display_fulfillment_status: Option<String>,
    #[serde(default)]
    customer: Option<BulkCustomer>,
    #[serde(default)]
    billing_address: Option<BulkAddress>,
    #[serde(default)]
    shipping_address: Option<BulkAddress>,
    #[serde(default)]
    line_items: Option<Connection<BulkLineItem>>,
}

/// Leading digits of an order name such as `#1001`.
fn order_number_from_name(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Map a GraphQL bulk node (with its line items folded in) to an [`OrderRecord`].
pub fn order_from_bulk_node(node: &Value) -> Result<OrderRecord, MappingError> {
    let order = BulkOrder::deserialize(node).map_err(|e| MappingError::Malformed(e.to_string()))?;

    let id = strip_gid(&order.id).to_string();
    if id.trim().is_empty() {
        return Err(MappingError::Malformed("empty order id".into()));
    }
    let order_number = order
        .name
        .as_deref()
        .and_then(order_number_from_name)
        .ok_or_else(|| MappingError::Malformed(format!("order {id} has no order number")))?;

    let currency = order
        .currency_code
        .or_else(|| order.total_price_set.shop_money.currency_code.clone())
        .unwrap_or_else(|| "EUR".to_string());

    let line_items = order
        .line_items
        .map(|c| c.edges)
        .unwrap_or_default()
        .into_iter()
        .map(|edge| {
            let item = edge.node;
            LineItem {
                id: item.id.as_deref().map(|i| strip_gid(i).to_string()),
                title: item.title,
                quantity: item.quantity,
                price: item
                    .original_unit_price_set
                    .map(|m| m.shop_money.amount)
                    .unwrap_or_else(|| "0".to_string()),
            }
        })
        .collect();

    Ok(OrderRecord {
        id,
        order_number,
        name: order.name,
        email: order.email,
        created_at: order.created_at,
        updated_at: order.updated_at,
        total_price: order.total_price_set.shop_money.amount,
        total_tax: order.total_tax_set.map(|m| m.shop_money.amount),
        currency,
        financial_status: order.display_financial_status.map(|s| s.to_ascii_lowercase()),
        fulfillment_status: order.display_fulfillment_status.map(|s| s.to_ascii_lowercase()),
        line_items,
        customer: order.customer.map(|c| Customer {
            id: c.id.as_deref().map(|i| strip_gid(i).to_string()),
            first_name: c.first_name,
            last_name: c.last_name,
            email: c.email,
            phone: c.phone,
        }),
        billing_address: order.billing_address.map(Address::from),
        shipping_address: order.shipping_address.map(Address::from),
    })
}
