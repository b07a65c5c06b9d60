//! Exponential backoff for transient direct-connection faults.

use crate::config::RetryConfig;
use crate::error::{DatabaseError, DbResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// attempts are used up.
    ///
    /// `on_connection_fault` runs before the next attempt whenever the failure
    /// means pooled connections can no longer be trusted.
    pub async fn run<T, Op, OpFut, Reset, ResetFut>(
        &self,
        label: &str,
        mut operation: Op,
        mut on_connection_fault: Reset,
    ) -> DbResult<T>
    where
        Op: FnMut(u32) -> OpFut,
        OpFut: Future<Output = DbResult<T>>,
        Reset: FnMut() -> ResetFut,
        ResetFut: Future<Output = ()>,
    {
        let mut attempt = 1;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                debug!("{} failed with non-transient error: {}", label, err);
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(
                    "{} failed after {} attempts: {}",
                    label, attempt, err
                );
                return Err(DatabaseError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if err.is_connection_fault() {
                warn!("{}: connection fault, rebuilding pool: {}", label, err);
                on_connection_fault().await;
            }

            let delay = self.delay_for(attempt);
            warn!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                label, attempt, self.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn permission_denied() -> DatabaseError {
        DatabaseError::Query {
            code: Some("42501".into()),
            message: "permission denied for table secrets".into(),
            detail: None,
            hint: None,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let resets = AtomicU32::new(0);
        let result = fast_policy()
            .run(
                "query",
                |_| async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(DatabaseError::Connection("connection reset by peer".into()))
                    } else {
                        Ok(n)
                    }
                },
                || async {
                    resets.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: DbResult<()> = fast_policy()
            .run(
                "query",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(permission_denied())
                },
                || async {},
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "42501");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_max_retries() {
        let calls = AtomicU32::new(0);
        let result: DbResult<()> = fast_policy()
            .run(
                "query",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::Timeout(50))
                },
                || async {},
            )
            .await;
        match result {
            Err(DatabaseError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DatabaseError::Timeout(50)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeouts_do_not_reset_pool() {
        let resets = AtomicU32::new(0);
        let _: DbResult<()> = fast_policy()
            .run(
                "query",
                |_| async { Err(DatabaseError::Timeout(50)) },
                || async {
                    resets.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }
}
