//! Shared exponential backoff for transient provider errors.

use crate::error::ProviderError;
use std::future::Future;
use std::time::Duration;

/// Backoff schedule for the provider-local retry loop.
///
/// Only `RateLimit` and `Timeout` are retried; every other kind propagates
/// immediately. Delays double from `base_delay` and are capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Standard schedule (1, 2, 4, … seconds, capped at 30 s) with the
    /// given retry cap.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Run `operation`, re-attempting retryable failures per the schedule.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.max_retries {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying transient provider error"
                    );
                    tokio::time::sleep(delay).await;
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

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(31), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_rate_limit_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::RateLimit("slow down".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Timeout("deadline".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Authentication("bad key".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(0)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::RateLimit("429".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
