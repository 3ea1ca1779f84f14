//! Circuit breaker to stop callers from hammering a degraded dependency.
//!
//! One implementation serves every call site. Each site picks:
//! - a [`FailureAccounting`] policy: consecutive failures, or failures inside a
//!   trailing observation window
//! - a [`HalfOpenPolicy`]: admit a single probe at a time, or admit everyone
//!
//! # State Transitions
//! ```text
//! Closed → Open:      failure accounting reaches failure_threshold
//! Open → HalfOpen:    first admission check after recovery_timeout
//! HalfOpen → Closed:  success_threshold consecutive successes
//! HalfOpen → Open:    any failure (recovery clock restarts)
//! ```
//!
//! Callers check [`CircuitBreaker::is_allowed`] before the guarded operation
//! and then report exactly one of [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::humantime_serde;

/// How failures are counted while closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailureAccounting {
    /// Count consecutive failures; any success resets the count
    Consecutive,

    /// Count failures inside a trailing window; successes only prune
    /// entries that have aged out
    SlidingWindow {
        #[serde(with = "humantime_serde")]
        observation_window: Duration,
    },
}

/// Who is admitted while half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// One probe at a time; others are rejected until it reports back
    SingleProbe,

    /// Every caller is admitted
    Unlimited,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,

    /// Successes needed to close circuit from half-open
    pub success_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Failure counting policy
    pub accounting: FailureAccounting,

    /// Half-open admission policy
    pub half_open: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            accounting: FailureAccounting::Consecutive,
            half_open: HalfOpenPolicy::SingleProbe,
        }
    }
}

impl CircuitBreakerConfig {
    /// Describe invalid fields, relative to this config.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.failure_threshold == 0 {
            problems.push("failure_threshold must be greater than 0".to_string());
        }
        if self.success_threshold == 0 {
            problems.push("success_threshold must be greater than 0".to_string());
        }
        if self.recovery_timeout.is_zero() {
            problems.push("recovery_timeout must be non-zero".to_string());
        }
        if let FailureAccounting::SlidingWindow { observation_window } = self.accounting {
            if observation_window.is_zero() {
                problems.push("accounting.observation_window must be non-zero".to_string());
            }
        }
        problems
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected without being attempted
    Open,

    /// Probing whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, safe to hand to metrics collectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently counted toward the threshold
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    /// Time left before an admission check may move OPEN → HALF_OPEN
    pub cooldown_remaining: Option<Duration>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_failure_reason: Option<String>,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { successes: u32, probe_in_flight: bool },
}

#[derive(Debug)]
enum FailureLog {
    Consecutive(u32),
    Window(VecDeque<Instant>),
}

impl FailureLog {
    fn for_policy(accounting: FailureAccounting) -> Self {
        match accounting {
            FailureAccounting::Consecutive => FailureLog::Consecutive(0),
            FailureAccounting::SlidingWindow { .. } => FailureLog::Window(VecDeque::new()),
        }
    }

    fn clear(&mut self) {
        match self {
            FailureLog::Consecutive(count) => *count = 0,
            FailureLog::Window(stamps) => stamps.clear(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        if let FailureLog::Window(stamps) = self {
            while stamps
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= window)
            {
                stamps.pop_front();
            }
        }
    }

    /// Add one failure and return the count toward the threshold.
    fn record(&mut self, now: Instant, accounting: FailureAccounting) -> u32 {
        if let FailureLog::Window(stamps) = self {
            stamps.push_back(now);
        }
        if let FailureAccounting::SlidingWindow { observation_window } = accounting {
            self.prune(now, observation_window);
        }
        match self {
            FailureLog::Consecutive(count) => {
                *count += 1;
                *count
            }
            FailureLog::Window(stamps) => stamps.len() as u32,
        }
    }

    fn count(&self, now: Instant, accounting: FailureAccounting) -> u32 {
        match (self, accounting) {
            (FailureLog::Consecutive(count), _) => *count,
            (FailureLog::Window(stamps), FailureAccounting::SlidingWindow { observation_window }) => {
                stamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < observation_window)
                    .count() as u32
            }
            (FailureLog::Window(stamps), FailureAccounting::Consecutive) => stamps.len() as u32,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    failures: FailureLog,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    last_failure_reason: Option<String>,
}

/// Failure-tracking gate shared by concurrent callers.
///
/// All transitions happen under one lock, so concurrent `is_allowed` /
/// `record_*` calls observe a consistent state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let failures = FailureLog::for_policy(config.accounting);
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                failures,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                last_failure_reason: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a call may be attempted.
    ///
    /// The only mutation is the OPEN → HALF_OPEN transition once the recovery
    /// timeout has elapsed (plus claiming the probe slot under
    /// [`HalfOpenPolicy::SingleProbe`]).
    pub fn is_allowed(&self) -> bool {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let allowed = match inner.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
                    inner.phase = Phase::HalfOpen {
                        successes: 0,
                        probe_in_flight: self.config.half_open == HalfOpenPolicy::SingleProbe,
                    };
                    tracing::info!(breaker = %self.name, "Circuit half-open, admitting recovery probe");
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen {
                ref mut probe_in_flight,
                ..
            } => match self.config.half_open {
                HalfOpenPolicy::Unlimited => true,
                HalfOpenPolicy::SingleProbe => {
                    if *probe_in_flight {
                        false
                    } else {
                        *probe_in_flight = true;
                        true
                    }
                }
            },
        };

        if !allowed {
            inner.total_rejections += 1;
        }
        allowed
    }

    /// Whether [`is_allowed`](Self::is_allowed) would admit a call right now,
    /// without claiming the half-open probe or moving OPEN → HALF_OPEN.
    ///
    /// For routing decisions; the call itself must still go through
    /// `is_allowed`.
    pub fn would_admit(&self) -> bool {
        let now = self.clock.now();
        match self.inner.lock().phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                now.saturating_duration_since(opened_at) >= self.config.recovery_timeout
            }
            Phase::HalfOpen {
                probe_in_flight, ..
            } => self.config.half_open == HalfOpenPolicy::Unlimited || !probe_in_flight,
        }
    }

    /// Record a successful guarded call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.total_successes += 1;

        match inner.phase {
            Phase::Closed => match self.config.accounting {
                FailureAccounting::Consecutive => inner.failures.clear(),
                FailureAccounting::SlidingWindow { observation_window } => {
                    inner.failures.prune(now, observation_window)
                }
            },
            Phase::HalfOpen { successes, .. } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    inner.phase = Phase::Closed;
                    inner.failures.clear();
                    tracing::info!(breaker = %self.name, "Circuit closed after successful recovery");
                } else {
                    inner.phase = Phase::HalfOpen {
                        successes,
                        probe_in_flight: false,
                    };
                }
            }
            Phase::Open { .. } => {
                // Result of a call admitted before the circuit opened.
                tracing::debug!(breaker = %self.name, "Ignoring success reported while open");
            }
        }
    }

    /// Record a failed guarded call.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.total_failures += 1;

        match inner.phase {
            Phase::Closed => {
                let count = inner.failures.record(now, self.config.accounting);

                if count >= self.config.failure_threshold {
                    inner.phase = Phase::Open { opened_at: now };
                    inner.failures.clear();
                    tracing::warn!(
                        breaker = %self.name,
                        failures = count,
                        reason = %reason,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            Phase::HalfOpen { .. } => {
                inner.phase = Phase::Open { opened_at: now };
                tracing::warn!(
                    breaker = %self.name,
                    reason = %reason,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            Phase::Open { .. } => {
                // Already open; the cooldown keeps its original start.
            }
        }

        inner.last_failure_reason = Some(reason);
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Immutable snapshot of counters and state.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();

        let (state, success_count, cooldown_remaining) = match inner.phase {
            Phase::Closed => (CircuitState::Closed, 0, None),
            Phase::Open { opened_at } => (
                CircuitState::Open,
                0,
                Some(
                    self.config
                        .recovery_timeout
                        .saturating_sub(now.saturating_duration_since(opened_at)),
                ),
            ),
            Phase::HalfOpen { successes, .. } => (CircuitState::HalfOpen, successes, None),
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failures.count(now, self.config.accounting),
            success_count,
            cooldown_remaining,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    /// Force the circuit closed and clear failure accounting.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Closed;
        inner.failures.clear();
        tracing::info!(breaker = %self.name, "Circuit manually reset");
    }

    /// Trip the circuit immediately, starting a fresh cooldown.
    pub fn force_open(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.phase = Phase::Open { opened_at: now };
        inner.failures.clear();
        tracing::warn!(breaker = %self.name, reason = %reason, "Circuit manually opened");
        inner.last_failure_reason = Some(reason);
    }
}
