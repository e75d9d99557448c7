//! Normalised upstream order record (REST field names).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

fn default_currency() -> String {
    "EUR".to_string()
}

/// Upstream ids arrive as JSON numbers from REST and as strings elsewhere.
pub(crate) fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Num(u64),
        Str(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Num(n) => Ok(n.to_string()),
        RawId::Str(s) if !s.trim().is_empty() => Ok(s),
        RawId::Str(_) => Err(serde::de::Error::custom("empty id")),
    }
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "id_string")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub order_number: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Decimal string in the shop currency.
    pub total_price: String,
    #[serde(default)]
    pub total_tax: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub financial_status: Option<String>,
    #[serde(default)]
    pub fulfillment_status: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub billing_address: Option<Address>,
    #[serde(default)]
    pub shipping_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub id: Option<String>,
    pub title: String,
    pub quantity: i64,
    pub price: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub address2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_ids_both_parse() {
        let base = json!({
            "order_number": 1001,
            "created_at": "2024-05-01T10:00:00+02:00",
            "total_price": "19.99",
        });

        let mut numeric = base.clone();
        numeric["id"] = json!(450789469u64);
        let order: OrderRecord = serde_json::from_value(numeric).unwrap();
        assert_eq!(order.id, "450789469");
        assert_eq!(order.currency, "EUR");

        let mut text = base;
        text["id"] = json!("450789469");
        let order: OrderRecord = serde_json::from_value(text).unwrap();
        assert_eq!(order.id, "450789469");
    }

    #[test]
    fn missing_required_fields_fail() {
        let err = serde_json::from_value::<OrderRecord>(json!({"id": 1})).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }
}
