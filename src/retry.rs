//! Resilience policy: exponential-backoff retry
//!
//! Used identically for the startup connection attempt and for every publish
//! call. Attempt `n` (1-indexed) waits `2^n` seconds before the next try;
//! only errors the caller's predicate accepts are retried, and after the
//! attempt budget is exhausted the last error propagates unmodified.

use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts
    pub max_delay: Duration,

    /// Base for exponential backoff
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::backoff(10)
    }
}

impl RetryConfig {
    /// The bus backoff schedule: waits of 2, 4, 8, ... seconds between
    /// attempts, up to `max_attempts` attempts in total.
    pub fn backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            exponential_base: 2.0,
        }
    }
}

/// Execute an operation with retries gated by a retryable-error predicate.
///
/// Errors rejected by `is_retryable` return immediately; retryable errors are
/// retried with exponential backoff until the attempt budget runs out, at
/// which point the last error is returned as-is.
///
/// # Example
///
/// ```rust,no_run
/// use eventbus::retry::{with_retry_if, RetryConfig};
/// use eventbus::BrokerError;
///
/// async fn example() -> Result<(), BrokerError> {
///     with_retry_if(
///         &RetryConfig::backoff(3),
///         || async { Err(BrokerError::Unreachable("down".into())) },
///         BrokerError::is_transient,
///     )
///     .await
/// }
/// ```
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut f: F,
    mut is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(error = %e, "error is not retryable, returning immediately");
                return Err(e);
            }
            Err(e) if attempt >= config.max_attempts => {
                tracing::error!(attempts = attempt, error = %e, "all retry attempts exhausted");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );

                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.exponential_base)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
