use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::HarborError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to delays (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before a given attempt number (0-indexed; attempt 0 is immediate)
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1);
        #[expect(clippy::cast_precision_loss)]
        let base_delay = (self.initial_delay_ms as f64)
            * self
                .backoff_multiplier
                .powi(i32::try_from(exponent).unwrap_or(i32::MAX));

        #[expect(clippy::cast_precision_loss)]
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        #[expect(clippy::cast_precision_loss)]
        let final_delay = (capped_delay + jitter).clamp(0.0, self.max_delay_ms as f64);

        Duration::from_millis(final_delay as u64)
    }
}

/// Whether an error is worth retrying. Cancellations and credential failures
/// never are; only transport-level trouble is.
#[must_use]
pub fn is_retryable_error(error: &HarborError) -> bool {
    match error {
        HarborError::Network { .. } => true,
        HarborError::Sftp { reason } => {
            reason.contains("channel") || reason.contains("connection")
        }
        _ => false,
    }
}

/// Execute an async operation with retry logic
///
/// # Errors
///
/// Returns the last error from the operation if all attempts fail.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_inner(config, operation_name, &mut operation, |_| true).await
}

/// Execute an async operation with retry, using a predicate to decide whether
/// a given failure should be retried
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error if all attempts
/// fail.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    with_retry_inner(config, operation_name, &mut operation, should_retry).await
}

async fn with_retry_inner<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    operation: &mut F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                operation = %operation_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Retrying after delay"
            );
            sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let is_last_attempt = attempt + 1 >= config.max_attempts;
                if !is_last_attempt && should_retry(&e) {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Operation failed, will retry"
                    );
                } else {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed, not retrying"
                    );
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
    }

    // max_attempts >= 1, so the loop either returned or stored an error
    Err(last_error.unwrap_or_else(|| unreachable!("at least one attempt was made")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 100);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_config_no_retry() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        // Capped at max
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(100), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: 0.5,
            ..Default::default()
        };

        let ms = config.delay_for_attempt(1).as_millis();
        assert!((50..=150).contains(&ms));
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&HarborError::Network {
            host: "test".to_string(),
            reason: "connection refused".to_string(),
        }));
        assert!(is_retryable_error(&HarborError::Sftp {
            reason: "channel closed unexpectedly".to_string(),
        }));
        assert!(!is_retryable_error(&HarborError::Sftp {
            reason: "permission denied".to_string(),
        }));
        assert!(!is_retryable_error(&HarborError::AuthExhausted {
            user: "u".to_string(),
            host: "h".to_string(),
        }));
        assert!(!is_retryable_error(&HarborError::TrustDecisionCancelled {
            host: "h".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            jitter: 0.0,
            ..Default::default()
        };
        let mut call_count = 0;

        let result: Result<i32, String> = with_retry(&config, "test", || {
            call_count += 1;
            async move {
                if call_count < 3 {
                    Err("temporary error".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count, 3);
    }

    #[tokio::test]
    async fn test_with_retry_all_attempts_fail() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            jitter: 0.0,
            ..Default::default()
        };
        let mut call_count = 0;

        let result: Result<i32, String> = with_retry(&config, "test", || {
            call_count += 1;
            async { Err("permanent error".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count, 3);
    }

    #[tokio::test]
    async fn test_with_retry_if_stops_on_non_retryable() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            jitter: 0.0,
            ..Default::default()
        };
        let mut call_count = 0;

        let result: Result<i32, String> = with_retry_if(
            &config,
            "test",
            || {
                call_count += 1;
                async { Err("permanent error".to_string()) }
            },
            |e| e.contains("retryable"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(call_count, 1);
    }

    #[tokio::test]
    async fn test_with_retry_if_retries_on_matching_predicate() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1,
            jitter: 0.0,
            ..Default::default()
        };
        let mut call_count = 0;

        let result: Result<i32, String> = with_retry_if(
            &config,
            "test",
            || {
                call_count += 1;
                async move {
                    match call_count {
                        1 => Err("retryable: network timeout".to_string()),
                        2 => Err("retryable: connection reset".to_string()),
                        _ => Ok(42),
                    }
                }
            },
            |e| e.starts_with("retryable"),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count, 3);
    }
}
