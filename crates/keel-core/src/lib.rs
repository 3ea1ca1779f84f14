//! # keel-core
//!
//! Runtime-free resilience primitives shared by every keel component.
//!
//! - [`ExponentialBackoff`]: the retry delay schedule (capped doubling with
//!   jitter)
//! - [`CircuitBreaker`]: one failure-detection state machine, configured per
//!   call site with a failure-accounting policy and a half-open admission
//!   policy
//! - [`ResilienceConfig`]: the configuration schema, loadable from YAML or
//!   JSON
//!
//! Nothing here spawns tasks or sleeps. The async pieces (resource pool, job
//! queue, retry loops) live in `keel-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use keel_core::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("search-index", CircuitBreakerConfig::default());
//! if breaker.is_allowed() {
//!     // ... call the dependency ...
//!     breaker.record_success();
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod config;

pub use backoff::ExponentialBackoff;
pub use breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureAccounting,
    HalfOpenPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackoffConfig, BreakersConfig, ConfigError, PoolConfig, QueueConfig, ResilienceConfig,
};
