//! # keel-runtime
//!
//! Async resilience components for agent services, built on tokio and the
//! primitives in `keel-core`.
//!
//! - [`ResourcePool`]: bounded, health-checked pool of expensive handles
//!   (browser sessions, connections) with idle and error-based eviction
//! - [`JobQueue`]: background job queue with retries, per-attempt timeouts,
//!   fallbacks and a dead-letter set
//! - [`EndpointGate`] / [`QueryGate`]: circuit-breaker gates for LLM
//!   endpoints and optional datastores
//! - [`run_with_retry`]: retry loop over an [`ExponentialBackoff`] schedule
//! - [`Services`]: builds and starts all of the above from one config
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_runtime::{job_fn, JobRequest, Services};
//!
//! let services = Services::builder(BrowserFactory::new())
//!     .config(ResilienceConfig::from_yaml_file("keel.yaml")?)
//!     .build()?;
//! services.start().await?;
//!
//! let job_id = services.queue().queue_job(
//!     JobRequest::new("scrape", job_fn(scrape)).args(json!({"url": url})),
//! )?;
//! ```

pub mod gate;
pub mod jobs;
pub mod lifecycle;
pub mod pool;
pub mod retry;
pub mod services;
pub mod shared;

pub use gate::{guard, guard_with_timeout, EndpointGate, GateError, QueryGate};
pub use jobs::{
    job_fn, JobError, JobId, JobOperation, JobQueue, JobRecord, JobRequest, JobStatus,
    QueueError, QueueMetrics,
};
pub use lifecycle::{Shutdown, ShutdownSignal};
pub use pool::{Lease, PoolError, PoolMetrics, ResourceError, ResourceFactory, ResourcePool};
pub use retry::{run_with_retry, wait};
pub use services::{Services, ServicesBuilder, ServicesError, ServicesMetrics};
pub use shared::{SharedError, SharedInstance};

pub use keel_core::ExponentialBackoff;
