//! Exponential backoff with jitter for upstream and store I/O.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Retryable;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Policy that never sleeps; handy for tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the backoff window for a zero-based retry index.
    pub fn ceiling_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(20));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Equal jitter: half the ceiling plus a random share of the other half.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling_for(retry);
        if ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        (half + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy
/// runs out of retries.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                let mut delay = policy.delay_for(retry);
                if let Some(floor) = err.retry_after() {
                    delay = delay.max(floor.min(policy.max_delay));
                }
                warn!(
                    op = label,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ceiling_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(60));
        assert_eq!(policy.ceiling_for(0), Duration::from_millis(500));
        assert_eq!(policy.ceiling_for(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling_for(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling_for(12), Duration::from_secs(60));
        for retry in 0..10 {
            let d = policy.delay_for(retry);
            assert!(d <= policy.max_delay);
            assert!(d >= policy.ceiling_for(retry) / 2);
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<u32, UpstreamError> =
            retry_async(&RetryPolicy::immediate(5), "test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(UpstreamError::transient("boom"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), UpstreamError> =
            retry_async(&RetryPolicy::immediate(5), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::from_status(400, "u", None))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), UpstreamError> =
            retry_async(&RetryPolicy::immediate(3), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::transient("still down"))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
