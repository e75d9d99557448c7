use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use ordersync_core::{DomainError, DomainResult, InvoiceId};

/// Days between invoice date and due date.
pub const DEFAULT_PAYMENT_TERM_DAYS: i64 = 14;

/// VAT rate recorded on imported invoices.
pub const DEFAULT_TAX_RATE_PERCENT: u8 = 19;

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Refunded,
    Void,
}

impl InvoiceStatus {
    /// Map an upstream payment state onto the local lifecycle.
    ///
    /// Unknown or missing states land in `Draft` so a human reviews them.
    pub fn from_financial_status(status: Option<&str>) -> Self {
        match status.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("paid") => InvoiceStatus::Paid,
            Some("pending") | Some("authorized") => InvoiceStatus::Open,
            Some("refunded") | Some("partially_refunded") => InvoiceStatus::Refunded,
            Some("voided") => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Billing party of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCustomer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: String,
    pub city: String,
    pub zip_code: String,
    pub country: String,
    pub company_name: Option<String>,
}

impl InvoiceCustomer {
    pub fn is_company(&self) -> bool {
        self.company_name.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// An order line as handed over by the importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub title: String,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

/// Invoice line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub line_no: u32,
    pub description: String,
    pub quantity: i64,
    pub unit_price: u64,
    pub total: u64,
}

/// Command: issue an invoice draft from an upstream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueFromOrder {
    pub external_order_id: String,
    pub order_number: u64,
    pub ordered_at: DateTime<Utc>,
    pub currency: String,
    pub customer: InvoiceCustomer,
    pub lines: Vec<OrderLine>,
    /// Order total in smallest currency unit, taken as authoritative.
    pub total_amount: u64,
    pub tax_amount: u64,
    pub financial_status: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Invoice draft created from an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDraft {
    pub id: InvoiceId,
    pub number: String,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub customer: InvoiceCustomer,
    pub lines: Vec<InvoiceLine>,
    pub subtotal: u64,
    pub tax_rate_percent: u8,
    pub tax_amount: u64,
    pub total: u64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub external_order_id: String,
    pub external_order_number: u64,
}

impl InvoiceDraft {
    /// Validate the command and build a draft.
    ///
    /// Zero-quantity lines (removed items) are dropped; negative quantities are rejected.
    pub fn issue_from_order(id: InvoiceId, cmd: &IssueFromOrder) -> DomainResult<Self> {
        if cmd.external_order_id.trim().is_empty() {
            return Err(DomainError::validation("order id must not be empty"));
        }
        if cmd.currency.len() != 3 || !cmd.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency must be a 3-letter code, got {:?}",
                cmd.currency
            )));
        }

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            if line.quantity < 0 {
                return Err(DomainError::validation(
                    "invoice line quantity must not be negative",
                ));
            }
            if line.quantity == 0 {
                continue;
            }
            let total = (line.quantity as u64)
                .checked_mul(line.unit_price)
                .ok_or_else(|| DomainError::validation("invoice line amount overflow"))?;
            lines.push(InvoiceLine {
                line_no: lines.len() as u32 + 1,
                description: line.title.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                total,
            });
        }

        let invoice_date = cmd.ordered_at.date_naive();
        let due_date = (cmd.issued_at + Duration::days(DEFAULT_PAYMENT_TERM_DAYS)).date_naive();

        Ok(Self {
            id,
            number: format!("SH-{}", cmd.order_number),
            invoice_date,
            due_date,
            customer: cmd.customer.clone(),
            lines,
            subtotal: cmd.total_amount.saturating_sub(cmd.tax_amount),
            tax_rate_percent: DEFAULT_TAX_RATE_PERCENT,
            tax_amount: cmd.tax_amount,
            total: cmd.total_amount,
            currency: cmd.currency.to_ascii_uppercase(),
            status: InvoiceStatus::from_financial_status(cmd.financial_status.as_deref()),
            external_order_id: cmd.external_order_id.clone(),
            external_order_number: cmd.order_number,
        })
    }

    pub fn line_total(&self) -> u64 {
        self.lines.iter().map(|l| l.total).sum()
    }
}
