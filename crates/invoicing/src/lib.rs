//! Invoicing domain module.
//!
//! Turns an upstream order snapshot into a local invoice draft. Pure domain
//! logic: no IO, no HTTP, no storage.

pub mod invoice;

pub use invoice::{
    DEFAULT_PAYMENT_TERM_DAYS, DEFAULT_TAX_RATE_PERCENT, InvoiceCustomer, InvoiceDraft,
    InvoiceLine, InvoiceStatus, IssueFromOrder, OrderLine,
};
