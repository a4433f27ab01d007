//! Retry logic.
//!
//! # Responsibilities
//! - Classify failures as retryable or fatal
//! - Execute retries with exponential backoff + jitter
//! - Honor server backoff hints (Retry-After) over the computed delay
//!
//! Fatal errors (auth, validation, open circuit, other 4xx) propagate on the
//! first attempt. After the last attempt the last error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Timeouts, network errors, 429 and 5xx are retryable; everything else is fatal.
pub fn default_classifier(err: &SyncError) -> ErrorClass {
    if err.is_retryable() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// The decision taken after a failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub last_error: ErrorKind,
    pub next_delay_ms: u64,
}

/// Retries classified-retryable failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            jitter_ratio: 0.1,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter_ratio)
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Plan the wait after failed attempt `attempt_number` (1-based).
    pub fn plan(&self, attempt_number: u32, err: &SyncError) -> RetryAttempt {
        let delay = err.retry_after().unwrap_or_else(|| {
            calculate_backoff(attempt_number, self.base_delay_ms, self.max_delay_ms, self.jitter_ratio)
        });
        RetryAttempt {
            attempt_number,
            max_attempts: self.max_attempts,
            last_error: err.kind(),
            next_delay_ms: delay.as_millis() as u64,
        }
    }

    /// Execute with the default classifier.
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.execute_with(operation, op, default_classifier).await
    }

    /// Execute `op`, passing the 1-based attempt number, classifying failures
    /// with `classify`.
    pub async fn execute_with<T, F, Fut, C>(&self, operation: &str, mut op: F, classify: C) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        C: Fn(&SyncError) -> ErrorClass,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if classify(&err) == ErrorClass::Fatal {
                tracing::debug!(operation = %operation, attempt, error = %err, "Fatal error, not retrying");
                return Err(err);
            }

            if attempt >= self.max_attempts {
                tracing::warn!(
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            let plan = self.plan(attempt, &err);
            tracing::info!(
                operation = %operation,
                attempt = plan.attempt_number,
                max_attempts = plan.max_attempts,
                error_kind = %plan.last_error,
                delay_ms = plan.next_delay_ms,
                "Retrying after transient error"
            );
            metrics::record_retry(operation, plan.last_error.as_str());

            tokio::time::sleep(Duration::from_millis(plan.next_delay_ms)).await;
            attempt += 1;
        }
    }
}
