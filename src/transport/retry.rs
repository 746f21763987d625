//! Retry with exponential backoff for provider calls
//!
//! A stateless loop driven by an explicit [`RetryPolicy`]. Backoff grows
//! exponentially, is jittered, and yields to a provider's `Retry-After` hint
//! whenever that hint asks for a longer wait.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Backoff before the first retry
    pub min_timeout: Duration,

    /// Upper bound for computed backoff
    pub max_timeout: Duration,

    /// Deadline for a single attempt; an attempt that exceeds it is aborted
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_millis(8000),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy for tests and tight loops (short backoff)
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Un-jittered backoff before retry `attempt` (1-based)
    ///
    /// `min(max_timeout, min_timeout * 2^(attempt-1))`
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base = self.min_timeout.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(base.min(self.max_timeout.as_secs_f64()))
    }

    /// Apply a jitter factor in `[1.0, 2.0)` and re-cap at `max_timeout`
    pub fn jittered(&self, base: Duration, factor: f64) -> Duration {
        let factor = factor.clamp(1.0, 2.0);
        base.mul_f64(factor).min(self.max_timeout)
    }

    /// Jittered backoff before retry `attempt` (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0..2.0);
        self.jittered(self.backoff_ceiling(attempt), factor)
    }

    /// Delay before retry `attempt`, honoring a server hint.
    ///
    /// The hint is never shortened: the result is the larger of the computed
    /// backoff and the hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.backoff_duration(attempt);
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

/// Parse a `Retry-After` header value (delta-seconds or HTTP-date)
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    // A date in the past means "retry now"
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry, waiting at least this long (from a Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    /// Determine if this error should be retried
    fn retry_decision(&self) -> RetryDecision;
}

/// Final outcome of a retried operation
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// The last error observed
    pub error: E,
    /// Number of attempts made, including the first
    pub attempts: u32,
}

/// Execute an async operation with retry logic
///
/// Attempts run strictly in sequence; attempt `n+1` starts only after the
/// backoff for attempt `n` has elapsed.
///
/// # Arguments
/// * `policy` - Retry policy
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to execute
///
/// # Returns
/// The result of the operation, or the last error and the attempt count
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let retry_after = match e.retry_decision() {
                    RetryDecision::NoRetry => {
                        debug!(
                            operation = operation_name,
                            attempt = attempt,
                            "Operation failed with non-retryable error: {}",
                            e
                        );
                        return Err(RetryFailure {
                            error: e,
                            attempts: attempt,
                        });
                    }
                    RetryDecision::Retry => None,
                    RetryDecision::RetryAfter(hint) => Some(hint),
                };

                if attempt > policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        "Operation failed after {} attempts: {}",
                        attempt,
                        e
                    );
                    return Err(RetryFailure {
                        error: e,
                        attempts: attempt,
                    });
                }

                let backoff = policy.delay_for(attempt, retry_after);

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_retries + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "Retrying after error: {}",
                    e
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
