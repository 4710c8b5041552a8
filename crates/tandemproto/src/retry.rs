//! Retry policies with capped exponential backoff.
//!
//! One policy per failure class:
//! - transient network: resend the same command id after an ack timeout
//! - transfer integrity: re-pull a file whose checksum did not match
//! - reconnect: node-side dial loop after the link drops
//!
//! Non-transient errors (a rejection, a permanent fault) stop the loop
//! immediately. Nothing here retries forever.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tandemconf::{RetryConfig, TransferConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure classes that have distinct policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    TransientNetwork,
    TransferIntegrity,
    Reconnect,
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Timeout per attempt
    pub timeout: Duration,
    /// Attempts after the first
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// A policy that sends once and never retries.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate backoff delay for a given attempt number
    ///
    /// attempt 0: no delay
    /// attempt n: min(backoff_base * 2^(n-1), backoff_max)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }
}

/// The three policies, built from config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub command: RetryPolicy,
    pub transfer: RetryPolicy,
    pub reconnect: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(retry: &RetryConfig, transfer: &TransferConfig) -> Self {
        Self {
            command: RetryPolicy {
                timeout: retry.command_timeout(),
                max_retries: retry.max_retries,
                backoff_base: Duration::from_millis(retry.backoff_base_ms),
                backoff_max: Duration::from_millis(retry.backoff_max_ms),
            },
            transfer: RetryPolicy {
                timeout: transfer.chunk_timeout(),
                max_retries: transfer.max_attempts.saturating_sub(1),
                backoff_base: Duration::from_millis(retry.backoff_base_ms),
                backoff_max: Duration::from_millis(retry.backoff_max_ms),
            },
            reconnect: RetryPolicy {
                timeout: Duration::ZERO,
                max_retries: retry.reconnect_max_attempts.saturating_sub(1),
                backoff_base: Duration::from_millis(retry.reconnect_base_ms),
                backoff_max: Duration::from_millis(retry.reconnect_max_ms),
            },
        }
    }

    pub fn for_class(&self, class: FailureClass) -> &RetryPolicy {
        match class {
            FailureClass::TransientNetwork => &self.command,
            FailureClass::TransferIntegrity => &self.transfer,
            FailureClass::Reconnect => &self.reconnect,
        }
    }
}

/// Errors that know whether another attempt could help.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("{op} gave up after {attempts} attempts: {last}")]
    Exhausted { op: String, attempts: u32, last: E },

    #[error("{op} failed permanently: {error}")]
    Permanent { op: String, error: E },
}

impl<E: fmt::Debug + fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the policy runs out.
///
/// The closure receives the zero-based attempt number. Backoff is applied
/// between attempts; the per-attempt timeout is the closure's business.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    E: Transient + fmt::Debug + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = policy.total_attempts();
    let mut n = 0;
    loop {
        let delay = policy.backoff_for_attempt(n);
        if !delay.is_zero() {
            debug!(op, attempt = n, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }

        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => {
                return Err(RetryError::Permanent {
                    op: op.to_string(),
                    error,
                });
            }
            Err(error) => {
                n += 1;
                if n >= total {
                    warn!(op, attempts = n, %error, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        op: op.to_string(),
                        attempts: n,
                        last: error,
                    });
                }
                debug!(op, attempt = n, %error, "attempt failed, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Timeout,
        Rejected,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Timeout)
        }
    }

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(10),
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
            ..Default::default()
        };

        assert_eq!(policy.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn policies_from_config() {
        let policies = RetryPolicies::from_config(&RetryConfig::default(), &TransferConfig::default());
        assert_eq!(policies.command.total_attempts(), 4);
        assert_eq!(policies.transfer.total_attempts(), 3);
        assert_eq!(policies.for_class(FailureClass::Reconnect).total_attempts(), 20);
    }

    #[tokio::test]
    async fn exhausts_after_one_plus_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry(&fast(3), "cmd", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Timeout)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry(&fast(5), "cmd", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Rejected)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Permanent { .. })));
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let result = retry(&fast(3), "cmd", |n| async move {
            if n < 2 {
                Err(TestError::Timeout)
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
