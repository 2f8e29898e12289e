//! Retry utilities for transient backend failures
//!
//! Two distinct delay schedules live here. `retry_on_connection` absorbs
//! transient connection loss with bounded exponential backoff before letting
//! the error escape. `calculate_backoff` is the linear-with-jitter ramp used
//! by the posting loop when competing producers collide on a marker range;
//! the jitter mitigates thrashing between parallel requests and creates
//! backpressure on clients.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::error::{StorageError, StorageResult};

/// Configurable retry policy for connection-level failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Execute an async operation, retrying only connection-class errors.
///
/// Semantic errors (not-found, not-permitted, conflict) propagate on the
/// first occurrence. The delay doubles after each failed attempt.
pub async fn retry_on_connection<F, T, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_connection() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                log::debug!(
                    "operation '{}' lost the backend connection on attempt {}/{}, retrying in {:?}: {}",
                    operation_name,
                    attempt,
                    policy.max_attempts,
                    delay,
                    error
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Calculate the sleep before re-attempting a conflicting bulk insert.
///
/// The baseline grows linearly with the attempt ratio, capped at
/// `max_sleep`, and a random jitter in `[0, max_jitter)` is added on top so
/// parallel producers do not retry in lockstep.
pub fn calculate_backoff(
    attempt: usize,
    max_attempts: usize,
    max_sleep: Duration,
    max_jitter: Duration,
) -> Duration {
    debug_assert!(attempt < max_attempts);

    let ratio = attempt as f64 / max_attempts.max(1) as f64;
    let backoff = max_sleep.mul_f64(ratio);
    let jitter = max_jitter.mul_f64(rand::random::<f64>());

    backoff + jitter
}

/// Convenience constructor for wrapping a backend transport failure.
pub fn connection_error(message: impl Into<String>) -> StorageError {
    StorageError::Connection {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = retry_on_connection("test_operation", &RetryPolicy::default(), || async {
            Ok::<i32, StorageError>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_connection_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };

        let counter = attempts.clone();
        let result = retry_on_connection("test_operation", &policy, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(connection_error("socket reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };

        let counter = attempts.clone();
        let result: StorageResult<()> = retry_on_connection("test_operation", &policy, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(connection_error("still down"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_connection());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_semantic_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let result: StorageResult<()> =
            retry_on_connection("test_operation", &RetryPolicy::default(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::NoPoolFound)
                }
            })
            .await;

        assert!(result.unwrap_err().is_does_not_exist());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_grows_linearly_and_stays_bounded() {
        let max_sleep = Duration::from_millis(100);
        let zero = Duration::ZERO;

        assert_eq!(calculate_backoff(0, 10, max_sleep, zero), Duration::ZERO);
        assert_eq!(
            calculate_backoff(5, 10, max_sleep, zero),
            Duration::from_millis(50)
        );
        let last = calculate_backoff(9, 10, max_sleep, zero);
        assert!(last < max_sleep);
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let max_jitter = Duration::from_millis(10);
        for _ in 0..100 {
            let delay = calculate_backoff(0, 10, Duration::ZERO, max_jitter);
            assert!(delay < max_jitter);
        }
    }
}
