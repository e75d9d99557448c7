//! `ordersync-core` — pure building blocks shared across the workspace.
//!
//! No I/O lives here: identifiers, the domain error, and the date-range /
//! upstream-filter translation.

pub mod error;
pub mod filters;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use filters::{DateRange, FilterTranslator, ImportFilter, UpstreamFilter};
pub use id::{InvoiceId, JobId};
