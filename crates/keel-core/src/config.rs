//! Configuration schema for the resilience stack.
//!
//! Every field has a default, so a minimal YAML document (or none at all) is
//! a valid configuration. Durations are humantime strings such as `"250ms"`
//! or `"5m"`.
//!
//! ```yaml
//! pool:
//!   max_pool_size: 4
//!   idle_eviction_age: 2m
//! breakers:
//!   datastore:
//!     failure_threshold: 5
//!     recovery_timeout: 30s
//!     accounting:
//!       policy: sliding_window
//!       observation_window: 1m
//! queue:
//!   worker_count: 2
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::breaker::{CircuitBreakerConfig, FailureAccounting, HalfOpenPolicy};

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Resource pool settings
    pub pool: PoolConfig,

    /// Breakers for each call site
    pub breakers: BreakersConfig,

    /// Retry delay schedule shared by the queue and retry helpers
    pub backoff: BackoffConfig,

    /// Background job queue settings
    pub queue: QueueConfig,
}

impl ResilienceConfig {
    /// Parse and validate from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check value ranges. Reports every problem, not just the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let pool = &self.pool;
        if pool.max_pool_size == 0 {
            problems.push("pool.max_pool_size must be greater than 0".to_string());
        }
        if pool.warm_size > pool.max_pool_size {
            problems.push(format!(
                "pool.warm_size ({}) exceeds pool.max_pool_size ({})",
                pool.warm_size, pool.max_pool_size
            ));
        }
        if pool.error_eviction_threshold == 0 {
            problems.push("pool.error_eviction_threshold must be greater than 0".to_string());
        }
        if pool.acquire_retry_interval.is_zero() {
            problems.push("pool.acquire_retry_interval must be non-zero".to_string());
        }
        if pool.sweep_interval.is_zero() {
            problems.push("pool.sweep_interval must be non-zero".to_string());
        }

        for (name, breaker) in [
            ("pool", &self.breakers.pool),
            ("llm", &self.breakers.llm),
            ("datastore", &self.breakers.datastore),
        ] {
            problems.extend(
                breaker
                    .problems()
                    .into_iter()
                    .map(|p| format!("breakers.{}.{}", name, p)),
            );
        }

        let backoff = &self.backoff;
        if backoff.max_delay < backoff.base_delay {
            problems.push("backoff.max_delay must be at least backoff.base_delay".to_string());
        }
        if !(0.0..=1.0).contains(&backoff.jitter_fraction) {
            problems.push(format!(
                "backoff.jitter_fraction must be within [0, 1], got {}",
                backoff.jitter_fraction
            ));
        }

        let queue = &self.queue;
        if queue.worker_count == 0 {
            problems.push("queue.worker_count must be greater than 0".to_string());
        }
        if queue.max_queue_size == 0 {
            problems.push("queue.max_queue_size must be greater than 0".to_string());
        }
        if queue.poll_interval.is_zero() {
            problems.push("queue.poll_interval must be non-zero".to_string());
        }
        if queue.default_timeout.is_some_and(|t| t.is_zero()) {
            problems.push("queue.default_timeout must be non-zero when set".to_string());
        }
        if queue.completed_ttl.is_zero() {
            problems.push("queue.completed_ttl must be non-zero".to_string());
        }
        if queue.max_completed == 0 {
            problems.push("queue.max_completed must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Resource pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live handles (idle + checked out)
    pub max_pool_size: usize,

    /// Idle handles older than this are closed by the sweeper
    #[serde(with = "humantime_serde")]
    pub idle_eviction_age: Duration,

    /// A handle reaching this many recorded errors is closed
    pub error_eviction_threshold: u32,

    /// Pause between acquire attempts while the pool is exhausted
    #[serde(with = "humantime_serde")]
    pub acquire_retry_interval: Duration,

    /// How often the idle sweeper runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Handles created eagerly on start
    pub warm_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            idle_eviction_age: Duration::from_secs(300),
            error_eviction_threshold: 3,
            acquire_retry_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(60),
            warm_size: 0,
        }
    }
}

/// One breaker config per call site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakersConfig {
    /// Gates handle creation in the resource pool
    pub pool: CircuitBreakerConfig,

    /// Gates calls to each LLM endpoint
    pub llm: CircuitBreakerConfig,

    /// Gates queries to the secondary datastore
    pub datastore: CircuitBreakerConfig,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            pool: CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                accounting: FailureAccounting::Consecutive,
                half_open: HalfOpenPolicy::SingleProbe,
            },
            llm: CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                accounting: FailureAccounting::Consecutive,
                half_open: HalfOpenPolicy::Unlimited,
            },
            datastore: CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                recovery_timeout: Duration::from_secs(30),
                accounting: FailureAccounting::SlidingWindow {
                    observation_window: Duration::from_secs(60),
                },
                half_open: HalfOpenPolicy::SingleProbe,
            },
        }
    }
}

/// Retry delay schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Uniform jitter band around each delay, 0.0 disables jitter
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: crate::backoff::DEFAULT_JITTER_FRACTION,
        }
    }
}

/// Background job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent workers started by default
    pub worker_count: usize,

    /// Submissions beyond this many pending jobs are rejected. Retries of
    /// already admitted jobs are requeued regardless.
    pub max_queue_size: usize,

    /// Retries granted to jobs that do not set their own
    pub default_max_retries: u32,

    /// Timeout applied to jobs that do not set their own
    #[serde(with = "humantime_serde::option")]
    pub default_timeout: Option<Duration>,

    /// How long an idle worker waits before re-checking for shutdown
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long succeeded job records stay queryable
    #[serde(with = "humantime_serde")]
    pub completed_ttl: Duration,

    /// Upper bound on retained succeeded job records
    pub max_completed: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_queue_size: 1000,
            default_max_retries: 3,
            default_timeout: None,
            poll_interval: Duration::from_secs(1),
            completed_ttl: Duration::from_secs(3600),
            max_completed: 10_000,
        }
    }
}

/// Serde adapters for humantime duration strings.
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_pool_size, 5);
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.backoff.jitter_fraction, 0.25);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = ResilienceConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn test_parse_humantime_and_policies() {
        let yaml = r#"
pool:
  max_pool_size: 2
  idle_eviction_age: 90s
breakers:
  llm:
    failure_threshold: 4
    recovery_timeout: 250ms
    half_open: single_probe
  datastore:
    accounting:
      policy: sliding_window
      observation_window: 2m
backoff:
  base_delay: 10ms
  max_delay: 1s
  jitter_fraction: 0.0
queue:
  worker_count: 1
  default_timeout: 5s
"#;
        let config = ResilienceConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.pool.max_pool_size, 2);
        assert_eq!(config.pool.idle_eviction_age, Duration::from_secs(90));
        assert_eq!(config.breakers.llm.failure_threshold, 4);
        assert_eq!(config.breakers.llm.recovery_timeout, Duration::from_millis(250));
        assert_eq!(config.breakers.llm.half_open, HalfOpenPolicy::SingleProbe);
        assert_eq!(
            config.breakers.datastore.accounting,
            FailureAccounting::SlidingWindow {
                observation_window: Duration::from_secs(120)
            }
        );
        assert_eq!(config.backoff.base_delay, Duration::from_millis(10));
        assert_eq!(config.queue.default_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_yaml_roundtrip_preserves_config() {
        let config = ResilienceConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(ResilienceConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = ResilienceConfig::default();
        config.pool.max_pool_size = 0;
        config.queue.worker_count = 0;
        config.backoff.jitter_fraction = 2.0;
        config.breakers.llm.failure_threshold = 0;

        match config.validate() {
            Err(ConfigError::Invalid(problems)) => {
                assert_eq!(problems.len(), 4, "{problems:?}");
                assert!(problems.iter().any(|p| p.starts_with("breakers.llm.")));
            }
            other => panic!("Expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_completed_retention_is_rejected() {
        let mut config = ResilienceConfig::default();
        config.queue.completed_ttl = Duration::ZERO;
        config.queue.max_completed = 0;

        match config.validate() {
            Err(ConfigError::Invalid(problems)) => {
                assert_eq!(
                    problems,
                    vec![
                        "queue.completed_ttl must be non-zero".to_string(),
                        "queue.max_completed must be greater than 0".to_string(),
                    ]
                );
            }
            other => panic!("Expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let result = ResilienceConfig::from_yaml("backoff:\n  base_delay: soon\n");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }
}
