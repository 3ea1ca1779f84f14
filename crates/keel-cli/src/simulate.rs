//! Synthetic workload: jobs lease a session from the pool, call an LLM
//! endpoint through its breaker and enrich from a datastore that degrades to
//! empty results. Every dependency fails at random.

use anyhow::{bail, Result};
use async_trait::async_trait;
use keel_core::ResilienceConfig;
use keel_runtime::{
    job_fn, JobError, JobId, JobRequest, JobStatus, ResourceError, ResourceFactory,
    Services, ServicesMetrics,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::SimulateArgs;

const ENDPOINTS: [&str; 2] = ["primary", "secondary"];

/// A fake session handle.
#[derive(Debug)]
struct Session {
    id: u64,
}

struct SimulatedBackend {
    failure_rate: f64,
    next_id: AtomicU64,
}

#[async_trait]
impl ResourceFactory for SimulatedBackend {
    type Handle = Session;

    fn kind(&self) -> &str {
        "session"
    }

    async fn create(&self) -> Result<Session, ResourceError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if chance(self.failure_rate / 2.0) {
            return Err(ResourceError::Create("session backend refused".into()));
        }
        Ok(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn health_check(&self, _session: &Session) -> bool {
        !chance(self.failure_rate / 4.0)
    }

    async fn close(&self, _session: Session) -> Result<(), ResourceError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Report {
    submitted: usize,
    elapsed_ms: u64,
    outcomes: BTreeMap<String, usize>,
    metrics: ServicesMetrics,
}

fn chance(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

fn demo_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.pool.max_pool_size = 3;
    config.pool.acquire_retry_interval = Duration::from_millis(20);
    config.breakers.pool.recovery_timeout = Duration::from_secs(1);
    config.breakers.llm.failure_threshold = 3;
    config.breakers.llm.recovery_timeout = Duration::from_millis(500);
    config.breakers.datastore.recovery_timeout = Duration::from_millis(500);
    config.backoff.base_delay = Duration::from_millis(50);
    config.backoff.max_delay = Duration::from_millis(500);
    config.queue.poll_interval = Duration::from_millis(100);
    config.queue.default_timeout = Some(Duration::from_secs(2));
    config
}

/// One job: lease a session, ask an endpoint, enrich from the datastore.
async fn run_task(
    services: &Services<SimulatedBackend>,
    failure_rate: f64,
    args: Value,
) -> Result<Value, JobError> {
    let lease = services.pool().acquire().await.map_err(JobError::failed)?;
    let session: &Session = &lease;
    let session = session.id;

    let Some(endpoint) = services.llm().select(&ENDPOINTS) else {
        lease.release(false);
        return Err(JobError::failed("no LLM endpoint available"));
    };

    // The secondary endpoint is the more reliable one.
    let rate = if endpoint == "primary" {
        failure_rate
    } else {
        failure_rate / 2.0
    };
    let request = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if chance(rate) {
            Err(format!("{} returned 503", endpoint))
        } else {
            Ok(format!("answer from {}", endpoint))
        }
    };

    let answer = match services.llm().call(endpoint, request).await {
        Ok(answer) => answer,
        Err(e) => {
            // A rejection says nothing about the session.
            lease.release(!e.is_rejected());
            let reason = e
                .into_inner()
                .unwrap_or_else(|| format!("{} circuit open", endpoint));
            return Err(JobError::Failed(reason));
        }
    };

    let context: Vec<String> = services
        .datastore()
        .run_or_default(async {
            if chance(failure_rate) {
                Err("datastore timeout")
            } else {
                Ok(vec!["related document".to_string()])
            }
        })
        .await;

    lease.release(false);
    Ok(json!({
        "input": args,
        "session": session,
        "endpoint": endpoint,
        "answer": answer,
        "context": context,
    }))
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("--failure-rate must be within [0, 1], got {}", args.failure_rate);
    }

    let config = match &args.config {
        Some(path) => crate::load_config(path)?,
        None => demo_config(),
    };
    let failure_rate = args.failure_rate;

    let services = Arc::new(
        Services::builder(SimulatedBackend {
            failure_rate,
            next_id: AtomicU64::new(1),
        })
        .config(config)
        .pool_name("sessions")
        .build()?,
    );
    services.start().await?;

    let task = {
        let services = services.clone();
        job_fn(move |args| {
            let services = services.clone();
            async move { run_task(&services, failure_rate, args).await }
        })
    };
    let fallback = job_fn(|args| async move {
        Ok::<_, JobError>(json!({ "input": args, "degraded": true }))
    });

    let started = Instant::now();
    let mut job_ids: Vec<JobId> = Vec::with_capacity(args.jobs);
    for n in 0..args.jobs {
        let request = JobRequest::new("answer", task.clone())
            .args(json!({ "question": n }))
            .fallback(fallback.clone());
        job_ids.push(services.queue().queue_job(request)?);
    }
    tracing::info!(jobs = args.jobs, failure_rate, "Workload submitted");

    let deadline = started + Duration::from_secs(args.deadline_secs);
    let outcomes = loop {
        let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
        let mut finished = 0;
        for job_id in &job_ids {
            let status = services.queue().get_status(job_id).await;
            if status.is_some_and(JobStatus::is_terminal) {
                finished += 1;
            }
            let label = status.map_or_else(|| "EXPIRED".to_string(), |s| s.to_string());
            *outcomes.entry(label).or_default() += 1;
        }

        if finished == job_ids.len() {
            break outcomes;
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                finished,
                total = job_ids.len(),
                "Deadline reached before all jobs finished"
            );
            break outcomes;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let report = Report {
        submitted: job_ids.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        outcomes,
        metrics: services.metrics().await,
    };
    services.stop().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
