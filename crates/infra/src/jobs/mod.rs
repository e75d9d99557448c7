//! Import jobs: records, the status machine, worker controls, and the
//! orchestrator that drives a job through its strategy.
//!
//! ## Components
//!
//! - `Job`: record with kind, status, progress, and per-record results
//! - `JobStore`: persistence for job records
//! - `JobManager`: transitions, operator actions, progress merging
//! - `JobControls`: pause/cancel signals for live workers
//! - `Orchestrator`: spawns and recovers workers

pub mod control;
pub mod manager;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use control::{AlreadyRunning, ControlLease, Interrupted, JobControl, JobControls};
pub use manager::{JobError, JobManager, JobUpdate};
pub use orchestrator::Orchestrator;
pub use store::{FileJobStore, InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobAction, JobData, JobId, JobKind, JobProgress, JobResults, JobStatus};
