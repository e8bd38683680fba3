//! Bounded retry with a fixed backoff for rate-limited remote calls.
//!
//! Only errors that report themselves as [`Transient`] are retried; anything
//! else is returned on the first failure. The whole sequence of attempts,
//! including the sleeps between them, is bounded by a wall-clock timeout.

use backoff::backoff::{Backoff, Constant};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can tell whether retrying the same call may succeed.
pub trait Transient {
    /// True for rate-limit signals from the remote system.
    fn is_transient(&self) -> bool;
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation still rate limited after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Failed(E),
}

impl<E> RetryError<E> {
    /// Map the wrapped error type, keeping the retry outcome.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> RetryError<F> {
        match self {
            RetryError::Timeout(timeout) => RetryError::Timeout(timeout),
            RetryError::Exhausted { attempts, last } => RetryError::Exhausted {
                attempts,
                last: f(last),
            },
            RetryError::Failed(e) => RetryError::Failed(f(e)),
        }
    }
}

/// Retry settings shared by every remote call of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Fixed sleep between attempts, matched to the remote reset window
    pub backoff: Duration,
    /// Wall-clock bound on all attempts together
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(45),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            timeout,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or the timeout elapses.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let attempts = self.attempt_all(operation_name, &mut operation);

        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation = operation_name,
                    timeout_secs = self.timeout.as_secs(),
                    "Operation timed out"
                );
                Err(RetryError::Timeout(self.timeout))
            }
        }
    }

    async fn attempt_all<T, E, F, Fut>(
        &self,
        operation_name: &str,
        operation: &mut F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = Constant::new(self.backoff);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Failed(e)),
                Err(e) => e,
            };

            metrics::counter!("sales.retry.attempts").increment(1);

            if attempts >= max_attempts {
                warn!(
                    operation = operation_name,
                    attempts = attempts,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts,
                    last: error,
                });
            }

            let delay = backoff.next_backoff().unwrap_or(self.backoff);
            debug!(
                operation = operation_name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, sleeping before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
