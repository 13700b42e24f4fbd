use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times, and how patiently, a fallible operation is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    /// Waiting time after the first failure, then grows linearly with each failure
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.backoff.saturating_mul(failed_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Runs `operation` until it succeeds, fails with a non retryable error, or runs out of attempts
///
/// The last error is returned as is.
pub async fn retry_with_backoff<T, E, Op, Fut, R>(
    policy: RetryPolicy,
    is_retryable: R,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_attempts && is_retryable(&error) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    %error,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Attempt failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
