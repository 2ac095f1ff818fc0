//! Classified-retry controller with exponential backoff and jitter
//! (`spec.md` §4.6).
//!
//! Grounded on the teacher's `with_timeout`/poisoned-connection retry loop
//! in `postgres/src/connection.rs` (`PostgresConnection::execute_str` et
//! al. retry once on a poisoned pool handle) generalized into a
//! standalone, attempt-bounded controller, since the source spec wants
//! retry behavior independent of any one connection.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use rand::Rng;

use crate::{config::RetryParams, error::Error};

#[derive(Debug, Default)]
pub struct RetryStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
}

impl RetryStats {
    fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Computes the backoff delay before attempt number `attempt` (1-indexed:
/// `attempt == 1` is the delay before the *second* try).
///
/// `spec.md` §4.6: `delay = min(initial * multiplier^(attempt-1),
/// maxInterval)`, optionally scaled by a uniform jitter factor in
/// `[0.5, 1.5)`.
pub fn backoff(params: &RetryParams, attempt: u32) -> Duration {
    let exponent = (attempt.saturating_sub(1)) as i32;
    let raw = params.initial_interval.as_secs_f64() * params.multiplier.powi(exponent);
    let capped = raw.min(params.max_interval.as_secs_f64()).max(0.0);
    let scaled = if params.jitter {
        let factor = rand::rng().random_range(0.5..1.5);
        capped * factor
    } else {
        capped
    };
    Duration::from_secs_f64(scaled.min(params.max_interval.as_secs_f64() * 1.5).max(0.0))
}

/// Runs `operation` up to `params.max_retries + 1` total attempts,
/// retrying only on `Error::is_retryable() == true` results, sleeping for
/// `backoff(attempt)` between tries.
pub struct RetryController {
    params: RetryParams,
    stats: RetryStats,
}

impl RetryController {
    pub fn new(params: RetryParams) -> Self {
        Self {
            params,
            stats: RetryStats::default(),
        }
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let total_attempts = self.params.max_retries + 1;
        let mut last_err = None;
        for attempt in 1..=total_attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match operation().await {
                Ok(value) => {
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_err = Some(err);
                    if !retryable || attempt == total_attempts {
                        break;
                    }
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff(&self.params, attempt)).await;
                }
            }
        }
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(last_err.expect("loop always runs at least once"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn params() -> RetryParams {
        RetryParams {
            max_retries: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_never_exceeds_max_interval() {
        let p = params();
        for attempt in 1..10 {
            assert!(backoff(&p, attempt) <= p.max_interval);
        }
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let p = params();
        assert_eq!(backoff(&p, 1), Duration::from_millis(1));
        assert_eq!(backoff(&p, 2), Duration::from_millis(2));
        assert_eq!(backoff(&p, 3), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_succeeds() {
        let controller = RetryController::new(params());
        let result = controller.execute(|| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(controller.stats().attempts, 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_max_retries() {
        let controller = RetryController::new(params());
        let calls = AtomicU32::new(0);
        let result = controller
            .execute(|| async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err::<i32, _>(Error::driver("query", anyhow::anyhow!("connection refused")))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 4); // max_retries(3) + 1
        assert_eq!(controller.stats().retries, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let controller = RetryController::new(params());
        let calls = AtomicU32::new(0);
        let result = controller
            .execute(|| async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err::<i32, _>(Error::ValidationFailed("bad input".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(controller.stats().retries, 0);
    }

    proptest::proptest! {
        // spec.md §8 property 1: backoff(n) <= maxInterval for all n >= 1,
        // and (without jitter) backoff is non-decreasing in n.
        #[test]
        fn backoff_is_bounded_and_monotonic_without_jitter(
            initial_ms in 1u64..500,
            max_ms in 500u64..10_000,
            multiplier in 1.0f64..4.0,
            max_attempt in 1u32..20,
        ) {
            let p = RetryParams {
                max_retries: 0,
                initial_interval: Duration::from_millis(initial_ms),
                max_interval: Duration::from_millis(max_ms),
                multiplier,
                jitter: false,
            };
            let mut previous = backoff(&p, 1);
            proptest::prop_assert!(previous <= p.max_interval);
            for attempt in 2..=max_attempt {
                let current = backoff(&p, attempt);
                proptest::prop_assert!(current <= p.max_interval);
                proptest::prop_assert!(current >= previous);
                previous = current;
            }
        }
    }
}
