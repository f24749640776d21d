//! Retry with exponential backoff and jitter for client sends.
//!
//! The ACN itself never retries a routed envelope: a failure goes back to
//! the sender as a status. Senders that want another attempt (for example
//! after `ERROR_AGENT_NOT_READY` while the target reconnects) opt in with a
//! [`RetryConfig`] whose `max_attempts` is above one.

use acn_types::{Status, StatusCode};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    ///
    /// The actual sleep is `delay * (1 + random_fraction * jitter)`, where
    /// `random_fraction` is in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            min_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Retry up to `max_attempts` times with the default delays.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All retries exhausted without success.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        attempts: u32,
    },
}

/// Compute the delay for a given attempt (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return capped;
    }

    let frac: f64 = rand::random();
    let with_jitter = (capped as f64) * (1.0 + frac * config.jitter);

    // Jitter can push slightly above the cap.
    (with_jitter as u64).min(config.max_delay_ms)
}

/// Statuses worth another attempt: the target may come back.
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.status_code,
        StatusCode::ErrorAgentNotReady | StatusCode::ErrorUnknownAgentAddress | StatusCode::ErrorGeneric
    )
}

/// Execute an async operation with retry.
///
/// `should_retry` inspects the error and returns `true` if another attempt
/// makes sense.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "retry succeeded after {} failures", attempt);
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => err,
        };

        let retryable = should_retry(&err);
        if attempt + 1 >= max || !retryable {
            if retryable {
                warn!(attempt = attempt + 1, max_attempts = max, "all retry attempts exhausted: {:?}", err);
            } else {
                debug!(attempt = attempt + 1, "error is not retryable, giving up: {:?}", err);
            }
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt + 1,
            };
        }

        let delay_ms = compute_backoff(config, attempt);
        debug!(attempt = attempt + 1, delay_ms, "retrying after error: {:?}", err);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 10,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_default_is_single_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(RetryConfig::attempts(4).max_attempts, 4);
    }

    #[test]
    fn test_compute_backoff_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            min_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: 0.0,
        };
        assert_eq!(compute_backoff(&config, 0), 1_000);
        assert_eq!(compute_backoff(&config, 2), 4_000);
        assert_eq!(compute_backoff(&config, 3), 5_000);
        assert_eq!(compute_backoff(&config, 40), 5_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            max_attempts: 3,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: 0.5,
        };
        for _ in 0..50 {
            let d = compute_backoff(&config, 1);
            assert!((200..=300).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable(&Status::error(StatusCode::ErrorAgentNotReady, "x")));
        assert!(!is_retryable(&Status::error(StatusCode::ErrorInvalidProof, "x")));
        assert!(!is_retryable(&Status::success()));
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let outcome = retry_async(
            &fast(5),
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok("finally")
                    }
                }
            },
            |_| true,
        )
        .await;
        match outcome {
            RetryOutcome::Success { result, attempts } => {
                assert_eq!(result, "finally");
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_gives_up_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let outcome = retry_async(
            &fast(5),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), &str>("fatal")
                }
            },
            |_| false,
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let outcome = retry_async(&fast(3), || async { Err::<(), &str>("down") }, |_| true).await;
        match outcome {
            RetryOutcome::Exhausted { last_error, attempts } => {
                assert_eq!(last_error, "down");
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected exhausted"),
        }
    }
}
