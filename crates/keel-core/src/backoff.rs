//! Exponential backoff schedule with jitter.
//!
//! `delay(attempt) = min(base_delay * 2^attempt, max_delay)`, then scaled by a
//! uniform factor in `[1 - jitter_fraction, 1 + jitter_fraction]` so that
//! concurrent callers do not retry in lock-step.
//!
//! The schedule is stateless. Every logical operation starts at `attempt = 0`.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Default jitter fraction applied to every delay.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.25;

/// Delay calculator for retry loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl ExponentialBackoff {
    /// Create a schedule with the default jitter fraction.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }

    /// Set the jitter fraction, clamped to `[0.0, 1.0]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Disable jitter so delays are exact.
    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Capped exponential delay before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay for `attempt` (zero-indexed), jittered with the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay for `attempt` using the given RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_fraction <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let low = 1.0 - self.jitter_fraction;
        let high = 1.0 + self.jitter_fraction;
        nominal.mul_f64(rng.gen_range(low..=high))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay, config.max_delay).with_jitter(config.jitter_fraction)
    }
}
