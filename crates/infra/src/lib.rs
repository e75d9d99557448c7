//! Infrastructure layer: job orchestration, upstream clients, durable
//! checkpoints and idempotency records, configuration.

pub mod checkpoint;
pub mod config;
pub mod idempotency;
pub mod import;
pub mod jobs;
pub mod retry;
pub mod upstream;
