//! Retry logic with exponential backoff.
//!
//! Only side-effect-free calls are retried here: transient store/catalog
//! failures and lock acquisition. Anything that mutated external entities
//! is surfaced to the caller instead.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::Result;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay before the second attempt
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add up to 10% jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = Duration::from_millis(base as u64).min(self.max_delay);

        if self.jitter {
            let jitter_ms = (capped.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
            capped + Duration::from_millis(jitter_ms)
        } else {
            capped
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Executor for `config`
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry settings
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation, retrying while it fails with a retryable error.
    ///
    /// The last error is returned unchanged once attempts run out.
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) if error.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.delay_after(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VaultError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = executor
            .execute("flaky", || {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(VaultError::unavailable("test", "retry test"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let executor = RetryExecutor::new(fast_config(5));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = executor
            .execute("broken", || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(VaultError::Validation("nope".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(VaultError::Validation(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_surfaces_last_error_after_max_attempts() {
        let executor = RetryExecutor::new(fast_config(2));
        let result: Result<()> = executor
            .execute("down", || async { Err(VaultError::unavailable("store", "down")) })
            .await;

        assert!(matches!(result, Err(VaultError::BackendUnavailable { .. })));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(250));
        assert_eq!(config.delay_after(30), Duration::from_millis(250));
    }
}
