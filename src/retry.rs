//! Retry, backoff and timeout utilities.
//!
//! The stream client uses [`RetryPolicy`] to schedule reconnection attempts.
//! Control API calls are never retried by the SDK itself; callers that want
//! retries wrap them in [`retry_async`] together with
//! [`ControlApiError::is_retryable`](crate::control::ControlApiError::is_retryable).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
///
/// Delays produced by [`RetryPolicy::delay_for_attempt`] never decrease as the
/// attempt number grows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Returns the schedule used for stream reconnection: five attempts,
    /// starting at 500ms and doubling up to 10s.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Returns a short schedule suitable for retrying idempotent control calls.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
        }
    }

    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based. Attempt `0` is treated like attempt `1`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
