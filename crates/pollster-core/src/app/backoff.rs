//! Backoff for transient infrastructure errors.

use std::future::Future;
use std::time::Duration;

use crate::domain::Transient;

/// Longest wait between two attempts.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff: `base_delay * multiplier^(attempt - 1)`, capped at
/// [`MAX_DELAY`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: 1,
        }
    }

    /// Delay before the next try, `attempts` being the number of failed
    /// attempts so far (1-indexed).
    ///
    /// With base_delay=100ms, multiplier=2.0: 100ms, 200ms, 400ms, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    let delay = self.next_delay(attempts);
                    tracing::warn!(
                        operation = what,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StoreError, TaskId};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: 5,
        };

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
    }

    #[rstest]
    #[case::many_attempts(2.0, u32::MAX)]
    #[case::infinite_multiplier(f64::INFINITY, 2)]
    #[case::past_the_cap(10.0, 5)]
    fn delay_is_capped(#[case] multiplier: f64, #[case] attempts: u32) {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier,
            max_attempts: u32::MAX,
        };

        assert_eq!(policy.next_delay(attempts), MAX_DELAY);
    }

    #[test]
    fn zero_base_delay_never_waits() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            multiplier: f64::INFINITY,
            max_attempts: 3,
        };
        assert_eq!(policy.next_delay(u32::MAX), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);

        let result: Result<u32, StoreError> = RetryPolicy::default()
            .retry("read", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StoreError::Unavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };

        let result: Result<(), StoreError> = policy
            .retry("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), StoreError> = RetryPolicy::default()
            .retry("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound(TaskId::random()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
