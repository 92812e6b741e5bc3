//! Device job queue

pub mod models;
pub mod queue;

pub use models::{job_types, JobRecord, JobStatus, JobSubmission};
pub use queue::{JobQueue, MemoryJobQueue, WORKFLOW_CANCEL_MESSAGE};
