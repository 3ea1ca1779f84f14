//! Breaker-guarded calls.
//!
//! [`guard`] wraps one future in a breaker: a rejected call never starts,
//! a finished call is recorded as success or failure. [`EndpointGate`] keeps
//! an independent breaker per endpoint (so one failing LLM backend does not
//! take the others down) and [`QueryGate`] guards a single optional
//! dependency whose failure should degrade to a default.

use keel_core::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a guarded call that did not produce a value.
#[derive(Error, Debug)]
pub enum GateError<E> {
    /// The breaker refused the call; the operation was never started.
    #[error("circuit '{name}' is open, call rejected")]
    Rejected { name: String },

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

impl<E> GateError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, GateError::Rejected { .. })
    }

    /// The operation's own error, if it ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            GateError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Records a failure if the guarded future is dropped before settling.
///
/// Without this a cancelled half-open probe would hold the probe slot forever.
struct Settle<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> Settle<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(mut self, reason: String) {
        self.settled = true;
        self.breaker.record_failure(reason);
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure("call cancelled");
        }
    }
}

/// Run `operation` through `breaker`.
pub async fn guard<F, T, E>(breaker: &CircuitBreaker, operation: F) -> Result<T, GateError<E>>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    if !breaker.is_allowed() {
        tracing::debug!(breaker = %breaker.name(), "Call rejected by open circuit");
        return Err(GateError::Rejected {
            name: breaker.name().to_string(),
        });
    }

    let settle = Settle::new(breaker);
    match operation.await {
        Ok(value) => {
            settle.success();
            Ok(value)
        }
        Err(e) => {
            settle.failure(e.to_string());
            Err(GateError::Failed(e))
        }
    }
}

/// Like [`guard`], with a deadline. A timeout counts as a failure.
pub async fn guard_with_timeout<F, T, E>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    operation: F,
) -> Result<T, GateError<E>>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    if !breaker.is_allowed() {
        tracing::debug!(breaker = %breaker.name(), "Call rejected by open circuit");
        return Err(GateError::Rejected {
            name: breaker.name().to_string(),
        });
    }

    let settle = Settle::new(breaker);
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => {
            settle.success();
            Ok(value)
        }
        Ok(Err(e)) => {
            settle.failure(e.to_string());
            Err(GateError::Failed(e))
        }
        Err(_) => {
            settle.failure(format!("timed out after {:?}", timeout));
            Err(GateError::TimedOut(timeout))
        }
    }
}

/// Independent breakers keyed by endpoint name.
///
/// Breakers are created on first use with the shared config.
pub struct EndpointGate {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl EndpointGate {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// The breaker for `endpoint`, created if absent.
    pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(endpoint) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    endpoint,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Whether a call to `endpoint` would currently be admitted. Claims
    /// nothing; make the call through [`call`](Self::call).
    pub fn is_available(&self, endpoint: &str) -> bool {
        self.breaker(endpoint).would_admit()
    }

    /// First candidate whose breaker would admit a call, in the order given.
    ///
    /// Routing only: the half-open probe is claimed by the following
    /// [`call`](Self::call), so an abandoned selection leaves the breaker
    /// untouched.
    pub fn select<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|ep| self.is_available(ep))
    }

    pub fn record_success(&self, endpoint: &str) {
        self.breaker(endpoint).record_success();
    }

    pub fn record_failure(&self, endpoint: &str, reason: impl Into<String>) {
        self.breaker(endpoint).record_failure(reason);
    }

    /// Run `operation` against `endpoint` through its breaker.
    pub async fn call<F, T, E>(&self, endpoint: &str, operation: F) -> Result<T, GateError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let breaker = self.breaker(endpoint);
        guard(&breaker, operation).await
    }

    /// Run `operation` with a deadline; a timeout trips the endpoint's breaker.
    pub async fn call_with_timeout<F, T, E>(
        &self,
        endpoint: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, GateError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let breaker = self.breaker(endpoint);
        guard_with_timeout(&breaker, timeout, operation).await
    }

    pub fn reset(&self, endpoint: &str) {
        if let Some(breaker) = self.breakers.read().get(endpoint) {
            breaker.reset();
        }
    }

    /// Snapshots of every endpoint seen so far, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }
}

impl Default for EndpointGate {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Guard for an optional dependency that degrades to a default when down.
#[derive(Debug)]
pub struct QueryGate {
    breaker: CircuitBreaker,
}

impl QueryGate {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn run<F, T, E>(&self, operation: F) -> Result<T, GateError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        guard(&self.breaker, operation).await
    }

    /// Run `operation`, substituting `T::default()` on rejection or failure.
    pub async fn run_or_default<F, T, E>(&self, operation: F) -> T
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
        T: Default,
    {
        match self.run(operation).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    gate = %self.breaker.name(),
                    error = %e,
                    "Query failed, using default"
                );
                T::default()
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}
