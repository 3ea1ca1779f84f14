//! Retry loops driven by [`ExponentialBackoff`].
//!
//! A fresh schedule starts at attempt 0 for every call; nothing is shared
//! between independent operations.

use keel_core::ExponentialBackoff;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Sleep for `backoff.delay(attempt)` and return the delay slept.
pub async fn wait(backoff: &ExponentialBackoff, attempt: u32) -> Duration {
    let delay = backoff.delay(attempt);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    delay
}

/// Run `operation` up to `max_retries` times in total.
///
/// After each failure that leaves attempts remaining, waits
/// `backoff.delay(attempt)` with `attempt` counting failed tries from zero.
/// Once `max_retries` attempts have failed the last error is returned. A
/// `max_retries` of zero still makes one attempt.
pub async fn run_with_retry<F, Fut, T, E>(
    backoff: &ExponentialBackoff,
    max_retries: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = max_retries.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= attempts => {
                tracing::warn!(attempts, error = %e, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = wait(backoff, attempt).await;
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5)).without_jitter()
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<&str, String> = run_with_retry(&fast(), 3, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("blip".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> = run_with_retry(&fast(), 4, || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", n)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_retries_still_attempts_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = run_with_retry(&fast(), 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_schedule() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter();
        let start = tokio::time::Instant::now();

        let result: Result<(), &str> = run_with_retry(&backoff, 3, || async { Err("down") }).await;

        assert!(result.is_err());
        // 100ms after the first failure, 200ms after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_delay() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1)).without_jitter();
        assert_eq!(wait(&backoff, 2).await, Duration::from_millis(200));
    }
}
