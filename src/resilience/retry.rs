//! # Retry Manager
//!
//! Re-runs a failing async operation with exponential backoff and bounded
//! random jitter. Errors that report themselves as non-retryable stop the
//! loop immediately.

use crate::error::ConductorError;
use crate::resilience::{CircuitBreakerError, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classifies whether an error is worth another attempt
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for ConductorError {
    fn is_retryable(&self) -> bool {
        ConductorError::is_retryable(self)
    }
}

impl<E: RetryableError> RetryableError for CircuitBreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            // Retrying into an open breaker only adds load
            CircuitBreakerError::CircuitOpen { .. } => false,
            CircuitBreakerError::OperationFailed(inner) => inner.is_retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("Operation failed with non-retryable error: {0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::NonRetryable(error) => error,
        }
    }
}

impl<E: Into<ConductorError>> From<RetryError<E>> for ConductorError {
    fn from(error: RetryError<E>) -> Self {
        error.into_inner().into()
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    name: String,
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    ///
    /// Saturates at `max_delay` however large `attempt` grows.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.config.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds =
            self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// Backoff plus a random jitter in `[0, jitter_max]`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.config.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.base_delay(attempt) + jitter
    }

    /// Run `operation` until it succeeds, fails non-retryably, or attempts run out
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        self.execute_with_classifier(operation, |error: &E| error.is_retryable())
            .await
    }

    /// Same as [`execute`](Self::execute) with an explicit retry classifier
    pub async fn execute_with_classifier<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %self.name, attempt, "🔁 Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) if !classify(&error) => {
                    debug!(operation = %self.name, attempt, error = %error, "Non-retryable failure");
                    return Err(RetryError::NonRetryable(error));
                }
                Err(error) if attempt >= max_attempts => {
                    warn!(
                        operation = %self.name,
                        attempts = attempt,
                        error = %error,
                        "🔴 Retry attempts exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    debug!(
                        operation = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
