//! Bounded exponential backoff for transient storage faults.
//!
//! Validation, not-found, and terminal-state errors pass through untouched;
//! only transient faults are retried, and exhaustion surfaces as
//! `Unavailable` so the caller aborts the current super-step with the last
//! durable checkpoint intact.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }
}

pub async fn with_backoff<T, F, Fut>(policy: &BackoffPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts.max(1) {
                    return Err(Error::Unavailable(format!("{op}: {e}")));
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(op, attempt, error = %e, "transient storage fault, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Storage("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_unavailable() {
        let err = with_backoff(&fast_policy(), "down", || async {
            Err::<(), _>(Error::Storage("gone".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_permanent_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let err = with_backoff(&fast_policy(), "bad-input", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Validation("no".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
