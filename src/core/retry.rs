//! Bounded retry for operations that talk to remote resources.
//!
//! An operation reports each failure as either [`Failure::Retriable`] or
//! [`Failure::Terminal`]. Only retriable failures are attempted again, on a
//! fixed backoff schedule. Whatever surfaces to the caller is the untagged
//! error, so callers never deal with the tagging scheme.

use crate::core::MonitorError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before each retry; the operation runs `backoff.len() + 1` times at most
    pub backoff: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetryConfig {
    /// A schedule with `retries` retries and no delay between them.
    pub fn immediate(retries: usize) -> Self {
        Self {
            backoff: vec![Duration::ZERO; retries],
        }
    }

    /// A schedule that never retries.
    pub fn none() -> Self {
        Self { backoff: Vec::new() }
    }

    /// Maximum number of times an operation is invoked
    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }
}

/// Outcome of a single failed attempt.
#[derive(Debug)]
pub enum Failure<E> {
    /// Transient failure, eligible for another attempt
    Retriable(E),
    /// Permanent failure, returned to the caller immediately
    Terminal(E),
}

impl<E> Failure<E> {
    /// Strip the tag.
    pub fn into_inner(self) -> E {
        match self {
            Self::Retriable(e) | Self::Terminal(e) => e,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }
}

impl<E> From<E> for Failure<E> {
    fn from(error: E) -> Self {
        Self::Terminal(error)
    }
}

/// Tag any error as retriable or terminal.
pub trait RetryExt: Sized {
    fn retriable(self) -> Failure<Self> {
        Failure::Retriable(self)
    }

    fn terminal(self) -> Failure<Self> {
        Failure::Terminal(self)
    }
}

impl<E: std::error::Error> RetryExt for E {}

/// Error returned by the executor.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(E),
}

impl<E: Into<MonitorError>> From<RetryError<E>> for MonitorError {
    fn from(error: RetryError<E>) -> Self {
        match error {
            RetryError::Cancelled => MonitorError::Cancelled,
            RetryError::Failed(e) => e.into(),
        }
    }
}

/// Execute an operation with retry logic
pub async fn retry_with_config<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure<E>>>,
    E: std::fmt::Display,
{
    let mut delays = config.backoff.iter();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(Failure::Terminal(error)) => return Err(RetryError::Failed(error)),
            Err(Failure::Retriable(error)) => error,
        };

        let Some(delay) = delays.next() else {
            tracing::error!("Operation failed after {} attempts: {}", attempt, error);
            return Err(RetryError::Failed(error));
        };

        tracing::warn!("Attempt {} failed: {}. Retrying in {:?}...", attempt, error, delay);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(*delay) => {},
        }
    }
}

/// Retry with the default 1s/3s/5s schedule
pub async fn retry<F, Fut, T, E>(
    cancel: &CancellationToken,
    operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure<E>>>,
    E: std::fmt::Display,
{
    retry_with_config(&RetryConfig::default(), cancel, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_two_failures() {
        let token = CancellationToken::new();
        let started = Instant::now();
        let mut calls = 0;

        let result = retry(&token, || {
            calls += 1;
            let count = calls;
            async move {
                if count < 3 {
                    Err(MonitorError::storage("temporary failure").retriable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_untagged_error() {
        let token = CancellationToken::new();
        let started = Instant::now();
        let mut calls = 0;

        let result: std::result::Result<(), _> = retry(&token, || {
            calls += 1;
            async { Err(MonitorError::storage("still down").retriable()) }
        })
        .await;

        assert_eq!(calls, 4);
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        match result {
            Err(RetryError::Failed(MonitorError::Storage(msg))) => assert_eq!(msg, "still down"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_terminal_error_is_not_retried() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: std::result::Result<(), _> = retry(&token, || {
            calls += 1;
            async { Err(MonitorError::config("permanent failure").terminal()) }
        })
        .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Failed(MonitorError::Config(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_aborts_during_backoff() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let mut calls = 0;
        let result: std::result::Result<(), _> = retry(&token, || {
            calls += 1;
            async { Err(MonitorError::storage("down").retriable()) }
        })
        .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_retry_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let mut calls = 0;

        let result: std::result::Result<(), RetryError<MonitorError>> = retry(&token, || {
            calls += 1;
            async { Ok(()) }
        })
        .await;

        assert_eq!(calls, 0);
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(MonitorError::from(result.unwrap_err()).is_cancelled());
    }

    #[test]
    fn test_immediate_schedule() {
        let config = RetryConfig::immediate(3);
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(RetryConfig::default().max_attempts(), 4);
        assert_eq!(RetryConfig::none().max_attempts(), 1);
    }
}
