//! Wiring for the whole resilience stack from one [`ResilienceConfig`].

use keel_core::{BreakerSnapshot, ConfigError, ExponentialBackoff, ResilienceConfig};
use serde::Serialize;
use thiserror::Error;

use crate::gate::{EndpointGate, QueryGate};
use crate::jobs::{JobQueue, QueueError, QueueMetrics};
use crate::pool::{PoolError, PoolMetrics, ResourceFactory, ResourcePool};

#[derive(Error, Debug)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Combined metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServicesMetrics {
    pub pool: PoolMetrics,
    pub queue: QueueMetrics,
    pub llm_endpoints: Vec<BreakerSnapshot>,
    pub datastore: BreakerSnapshot,
}

/// Builder for [`Services`].
pub struct ServicesBuilder<F: ResourceFactory> {
    factory: F,
    config: ResilienceConfig,
    pool_name: String,
}

impl<F: ResourceFactory> ServicesBuilder<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            config: ResilienceConfig::default(),
            pool_name: "resources".to_string(),
        }
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Validate the config and construct every component, stopped.
    pub fn build(self) -> Result<Services<F>, ServicesError> {
        self.config.validate()?;
        let config = self.config;

        let pool = ResourcePool::new(
            self.pool_name,
            self.factory,
            config.pool.clone(),
            config.breakers.pool.clone(),
        );
        let queue = JobQueue::new(
            config.queue.clone(),
            ExponentialBackoff::from(&config.backoff),
        );
        let llm = EndpointGate::new(config.breakers.llm.clone());
        let datastore = QueryGate::new("datastore", config.breakers.datastore.clone());

        Ok(Services {
            config,
            pool,
            queue,
            llm,
            datastore,
        })
    }
}

/// The pool, job queue and breaker gates of one process.
pub struct Services<F: ResourceFactory> {
    config: ResilienceConfig,
    pool: ResourcePool<F>,
    queue: JobQueue,
    llm: EndpointGate,
    datastore: QueryGate,
}

impl<F: ResourceFactory> Services<F> {
    pub fn builder(factory: F) -> ServicesBuilder<F> {
        ServicesBuilder::new(factory)
    }

    /// Start the pool, then the queue workers. If the queue cannot start the
    /// pool is stopped again.
    pub async fn start(&self) -> Result<(), ServicesError> {
        self.pool.start().await?;
        if let Err(e) = self.queue.start(self.config.queue.worker_count) {
            self.pool.stop().await;
            return Err(e.into());
        }
        tracing::info!("Services started");
        Ok(())
    }

    /// Stop the queue (letting running jobs finish), then the pool.
    pub async fn stop(&self) {
        self.queue.stop().await;
        self.pool.stop().await;
        tracing::info!("Services stopped");
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn llm(&self) -> &EndpointGate {
        &self.llm
    }

    pub fn datastore(&self) -> &QueryGate {
        &self.datastore
    }

    pub async fn metrics(&self) -> ServicesMetrics {
        ServicesMetrics {
            pool: self.pool.metrics(),
            queue: self.queue.metrics().await,
            llm_endpoints: self.llm.snapshots(),
            datastore: self.datastore.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{job_fn, JobError, JobRequest, JobStatus};
    use crate::pool::ResourceError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Sessions {
        next: AtomicU64,
    }

    #[async_trait]
    impl ResourceFactory for Sessions {
        type Handle = u64;

        async fn create(&self) -> Result<u64, ResourceError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _handle: u64) -> Result<(), ResourceError> {
            Ok(())
        }
    }

    fn test_config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.queue.worker_count = 2;
        config.queue.poll_interval = Duration::from_millis(20);
        config.backoff.base_delay = Duration::from_millis(5);
        config.backoff.max_delay = Duration::from_millis(50);
        config
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = ResilienceConfig::default();
        config.pool.max_pool_size = 0;

        let result = Services::builder(Sessions::default()).config(config).build();
        assert!(matches!(result, Err(ServicesError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn test_jobs_use_pooled_resources() {
        let services = Services::builder(Sessions::default())
            .config(test_config())
            .pool_name("sessions")
            .build()
            .unwrap();
        services.start().await.unwrap();

        let pool = services.pool().clone();
        let op = job_fn(move |args| {
            let pool = pool.clone();
            async move {
                let lease = pool.acquire().await.map_err(JobError::failed)?;
                let session = *lease;
                lease.release(false);
                Ok::<_, JobError>(json!({ "session": session, "input": args }))
            }
        });

        let job_id = services
            .queue()
            .queue_job(JobRequest::new("lookup", op).args(json!(42)))
            .unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = services.queue().get_status(&job_id).await;
            if status.is_some_and(JobStatus::is_terminal) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Some(JobStatus::Succeeded));

        let metrics = services.metrics().await;
        assert_eq!(metrics.pool.name, "sessions");
        assert_eq!(metrics.pool.created, 1);
        assert_eq!(metrics.queue.succeeded, 1);
        assert_eq!(metrics.queue.workers, 2);

        services.stop().await;
        assert!(!services.pool().is_running());
        assert!(!services.queue().is_running());
    }

    #[tokio::test]
    async fn test_gates_follow_config() {
        let mut config = test_config();
        config.breakers.llm.failure_threshold = 1;
        let services = Services::builder(Sessions::default())
            .config(config)
            .build()
            .unwrap();

        services.llm().record_failure("primary", "503");
        assert_eq!(services.llm().select(&["primary", "backup"]), Some("backup"));

        let rows: Vec<String> = services
            .datastore()
            .run_or_default(async { Err::<Vec<String>, _>("unreachable") })
            .await;
        assert!(rows.is_empty());

        let metrics = services.metrics().await;
        assert_eq!(metrics.llm_endpoints.len(), 2);
        assert_eq!(metrics.datastore.total_failures, 1);
    }
}
