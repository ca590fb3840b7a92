//! Exponential-backoff retry execution over the `ErrorClass` taxonomy
//! (spec §4.10, §7).

use crate::error::{ErrorClass, FileOpError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`. `attempt` is 1-based.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        scaled.min(self.max_delay)
    }

    pub fn is_safe_to_retry(&self, error: &FileOpError) -> bool {
        error.classify() == ErrorClass::Transient
    }

    /// Run `op` up to `max_attempts` times. Retries only
    /// [`ErrorClass::Transient`] failures; `Permanent` and `Cancelled`
    /// short-circuit immediately. `on_retry` is invoked before each
    /// backoff sleep, e.g. so a caller can publish network-retry progress.
    pub async fn execute_with_retry<F, Fut, T, OnRetry>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: OnRetry,
    ) -> Result<T, FileOpError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FileOpError>>,
        OnRetry: FnMut(u32, u32),
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FileOpError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let class = e.classify();
                    if class != ErrorClass::Transient || attempt >= self.max_attempts {
                        if class == ErrorClass::Transient {
                            warn!("retry attempts exhausted after {} tries: {}", attempt, e);
                        }
                        return Err(e);
                    }

                    let delay = self.backoff_for_attempt(attempt);
                    debug!(
                        "transient error on attempt {}/{}: {}; backing off {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    on_retry(attempt, self.max_attempts);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(FileOpError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn permanent_error_does_not_retry() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute_with_retry(
                &cancel,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(FileOpError::PermissionDenied("nope".into())) }
                },
                |_, _| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute_with_retry(
                &cancel,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(FileOpError::DeviceBusy("disk".into()))
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let cancel = CancellationToken::new();

        let result: Result<(), _> = policy
            .execute_with_retry(
                &cancel,
                || async { Err(FileOpError::Timeout(Duration::from_secs(1))) },
                |_, _| {},
            )
            .await;

        assert!(matches!(result, Err(FileOpError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_immediately() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = policy
            .execute_with_retry(&cancel, || async { Ok(()) }, |_, _| {})
            .await;

        assert!(matches!(result, Err(FileOpError::Cancelled)));
    }
}
