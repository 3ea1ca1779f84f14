//! Job model: operations, requests and status records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker
    Pending,
    Running,
    Succeeded,
    /// Retries exhausted; the job is in the dead-letter set
    Failed,
    /// Failed at least once and scheduled to run again
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Retrying => "RETRYING",
        };
        f.write_str(label)
    }
}

/// Why a single attempt of a job did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(message: impl fmt::Display) -> Self {
        JobError::Failed(message.to_string())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::Failed(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::Failed(message.to_string())
    }
}

/// Work executed by the queue.
///
/// Operations receive the job's arguments on every attempt, so they must be
/// safe to run more than once.
#[async_trait]
pub trait JobOperation: Send + Sync {
    async fn run(&self, args: &Value) -> Result<Value, JobError>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> JobOperation for FnOperation<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn run(&self, args: &Value) -> Result<Value, JobError> {
        (self.0)(args.clone()).await
    }
}

/// Wrap an async closure as a [`JobOperation`].
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobOperation>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

/// A job to submit to the queue.
///
/// Unset retry and timeout values fall back to the queue's defaults.
#[derive(Clone)]
pub struct JobRequest {
    pub(crate) job_type: String,
    pub(crate) operation: Arc<dyn JobOperation>,
    pub(crate) args: Value,
    pub(crate) max_retries: Option<u32>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) fallback: Option<Arc<dyn JobOperation>>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, operation: Arc<dyn JobOperation>) -> Self {
        Self {
            job_type: job_type.into(),
            operation,
            args: Value::Null,
            max_retries: None,
            timeout: None,
            fallback: None,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Retries after the first attempt; `0` means run once.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Per-attempt deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Operation run with the same arguments when an attempt times out.
    pub fn fallback(mut self, fallback: Arc<dyn JobOperation>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("job_type", &self.job_type)
            .field("args", &self.args)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Queryable snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure, or a note such as the fallback marker on success
    pub error: Option<String>,
    pub result: Option<Value>,
    pub used_fallback: bool,
}

impl JobRecord {
    pub(crate) fn new(job_type: String, max_retries: u32, timeout: Option<Duration>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            used_fallback: false,
        }
    }
}
