//! Background job execution.

mod queue;
mod store;
mod types;

pub use queue::{JobQueue, QueueError, QueueMetrics};
pub use store::CompletedJobs;
pub use types::{job_fn, JobError, JobId, JobOperation, JobRecord, JobRequest, JobStatus};
