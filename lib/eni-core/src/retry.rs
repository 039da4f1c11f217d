//! Capped exponential backoff for control-plane calls

use crate::cloud::{CloudError, CloudResult};
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for control-plane calls
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff
    pub max_backoff_ms: u64,
    /// Deadline for a single call
    pub call_timeout_ms: u64,
    /// Randomize each backoff by up to 50% either way
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            call_timeout_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential schedule for this policy. Attempts are bounded by
    /// `max_attempts`, never by elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        let initial_interval = Duration::from_millis(self.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            randomization_factor: if self.jitter { 0.5 } else { 0.0 },
            multiplier: 2.0,
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Run `call` until it succeeds, fails with a terminal error, or the policy
/// runs out of attempts. Each attempt is bounded by the call timeout.
pub async fn retry_cloud<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let timeout = policy.call_timeout();
    let mut attempt = 0u32;

    backoff::future::retry_notify(
        policy.backoff(),
        move || {
            attempt += 1;
            let current = attempt;
            let pending = call();
            async move {
                let result = match tokio::time::timeout(timeout, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(CloudError::timeout(operation)),
                };
                result.map_err(|err| {
                    if !err.is_retryable() {
                        debug!(operation, error = %err, "terminal control-plane error");
                        backoff::Error::permanent(err)
                    } else if current >= max_attempts {
                        warn!(operation, attempts = current, error = %err, "control-plane retries exhausted");
                        backoff::Error::permanent(err)
                    } else {
                        backoff::Error::transient(err)
                    }
                })
            }
        },
        |err: CloudError, wait: Duration| {
            debug!(operation, ?wait, error = %err, "retrying control-plane call");
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::codes;
    use backoff::backoff::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            call_timeout_ms: 1_000,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
            ..RetryPolicy::default()
        };
        let mut schedule = policy.backoff();
        let waits: Vec<u128> = (0..6)
            .map(|_| schedule.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_within_half_of_interval() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 100,
            jitter: true,
            ..RetryPolicy::default()
        };
        let mut schedule = policy.backoff();
        for _ in 0..20 {
            let wait = schedule.next_backoff().unwrap();
            assert!(wait >= Duration::from_millis(50));
            assert!(wait <= Duration::from_millis(151));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_cloud(&fast_policy(5), "DescribeSubnets", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CloudError::throttled())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: CloudResult<()> = retry_cloud(&fast_policy(5), "CreateInterface", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CloudError::new(codes::UNAUTHORIZED, "denied"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: CloudResult<()> = retry_cloud(&fast_policy(3), "AttachInterface", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CloudError::throttled())
        })
        .await;

        assert_eq!(result, Err(CloudError::throttled()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy {
            call_timeout_ms: 5,
            ..fast_policy(1)
        };
        let result: CloudResult<()> = retry_cloud(&policy, "DetachInterface", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap_err().code, codes::REQUEST_TIMEOUT);
    }
}
