//! Bounded exponential backoff for chain and signer calls

use crate::config::ResolverConfig;
use crate::error::{ResolverError, ResolverResult};

use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the base
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> ResolverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResolverResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bound a suspension point, mapping expiry onto a transient error
pub async fn with_timeout<T, Fut>(limit: Duration, operation: &str, fut: Fut) -> ResolverResult<T>
where
    Fut: Future<Output = ResolverResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ResolverError::Timeout {
            operation: operation.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(500));
        assert_eq!(p.delay(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_until_budget() {
        let calls = AtomicU32::new(0);
        let result: ResolverResult<()> = policy()
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResolverError::Timeout {
                    operation: "probe".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation_errors() {
        let calls = AtomicU32::new(0);
        let result: ResolverResult<()> = policy()
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResolverError::InvalidHtlcParams("zero timelock".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let value = policy()
            .run("probe", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ResolverError::Rpc {
                        chain: "bitcoin".to_string(),
                        message: "connection reset".to_string(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let err = with_timeout(Duration::from_millis(5), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
