//! Exponential-backoff retry executor for flaky outbound dependencies.
//!
//! Only transient faults (network, timeout, cancellation) are retried; every
//! other fault is returned to the caller on the first occurrence.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use casefile_ai::GenerationError;

/// How a fault behaves under retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Network,
    Timeout,
    Cancelled,
    /// Not worth retrying (bad request, undecodable response, ...).
    Permanent,
}

impl RetryClass {
    pub fn is_transient(&self) -> bool {
        !matches!(self, RetryClass::Permanent)
    }
}

/// Faults that can tell the retry executor what kind they are.
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

impl Retryable for GenerationError {
    fn retry_class(&self) -> RetryClass {
        match self {
            GenerationError::Timeout(_) => RetryClass::Timeout,
            GenerationError::Network(_) => RetryClass::Network,
            GenerationError::Cancelled(_) => RetryClass::Cancelled,
            GenerationError::Decode(_) | GenerationError::Service { .. } => RetryClass::Permanent,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 is treated as 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier: 2.0,
            max_delay,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay after failed attempt `attempt` (1-indexed): `initial * multiplier^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1).min(63) as i32);

        Duration::from_millis((base_ms * factor).min(max_ms).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.retry_class();
                    if !class.is_transient() || !self.should_retry(attempt) {
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        class = ?class,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
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

    #[derive(Debug)]
    struct Fault(RetryClass);

    impl Display for Fault {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Retryable for Fault {
        fn retry_class(&self) -> RetryClass {
            self.0
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(2))
            .with_multiplier(3.0);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(2));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = fast(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy { max_attempts: 0, ..fast(0) }.should_retry(1));
    }

    #[tokio::test]
    async fn retries_transient_faults_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<&str, Fault> = fast(3)
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Fault(RetryClass::Network))
                } else {
                    Ok("ok")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Fault> = fast(2)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Fault(RetryClass::Timeout))
            })
            .await;

        assert!(matches!(result, Err(Fault(RetryClass::Timeout))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_faults_propagate_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Fault> = fast(5)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Fault(RetryClass::Permanent))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn generation_faults_map_to_retry_classes() {
        assert_eq!(GenerationError::Timeout("x".into()).retry_class(), RetryClass::Timeout);
        assert_eq!(GenerationError::Cancelled("x".into()).retry_class(), RetryClass::Cancelled);
        assert_eq!(GenerationError::Decode("x".into()).retry_class(), RetryClass::Permanent);
    }
}
