//! Error taxonomy shared by every subsystem.
//!
//! # Classification
//! ```text
//! Validation          local, never retried
//! RateLimitExceeded   absorbed by the limiter, retryable if it escapes
//! CircuitOpen         fail fast, no network attempt, alert path
//! Transient           429 / 5xx / timeout / network, retried per policy
//! Api                 other non-retryable remote status (400, 404, 409...)
//! Authentication      401 / 403, fatal, alert path
//! OrchestrationConfig dependency cycle or unknown dependency, before any job
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::result::SyncReport;

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a transient failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientCause {
    /// The call did not complete within its deadline.
    Timeout,
    /// Connection refused, reset, DNS failure.
    Network,
    /// The remote answered with a retryable 5xx status.
    Server(u16),
    /// The remote answered 429.
    TooManyRequests,
}

impl fmt::Display for TransientCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network error"),
            Self::Server(status) => write!(f, "server error {}", status),
            Self::TooManyRequests => write!(f, "429 too many requests"),
        }
    }
}

/// Errors produced by the synchronization core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad input rejected before any request was built.
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// The limiter was bypassed and the remote throttled us.
    #[error("rate limit exceeded for {operation}")]
    RateLimitExceeded {
        operation: String,
        retry_after: Option<Duration>,
    },

    /// The breaker for this operation is open.
    #[error("circuit open for {operation}, retry in {retry_in:?}")]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    /// Retryable remote failure.
    #[error("transient failure on {operation}: {cause}: {message}")]
    Transient {
        operation: String,
        cause: TransientCause,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable remote failure.
    #[error("api error on {operation} (status {status}): {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// Credentials were rejected (401/403).
    #[error("authentication failed on {operation} (status {status}): {message}")]
    Authentication {
        operation: String,
        status: u16,
        message: String,
    },

    /// Invalid job graph.
    #[error("orchestration config error: {0}")]
    OrchestrationConfig(String),

    /// An upstream source failed to yield records.
    #[error("source error for {entity_type}: {message}")]
    Source {
        entity_type: String,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// A run stopped early on a job-level, breaker or auth error.
    #[error("sync run aborted: {source}")]
    RunAborted {
        report: Box<SyncReport>,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(
        operation: impl Into<String>,
        cause: TransientCause,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            operation: operation.into(),
            cause,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Map an HTTP status onto the taxonomy.
    pub fn from_status(
        operation: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let operation = operation.into();
        let message = message.into();
        match status {
            401 | 403 => Self::Authentication {
                operation,
                status,
                message,
            },
            429 => Self::Transient {
                operation,
                cause: TransientCause::TooManyRequests,
                message,
                retry_after,
            },
            500 | 502 | 503 | 504 => Self::Transient {
                operation,
                cause: TransientCause::Server(status),
                message,
                retry_after,
            },
            _ => Self::Api {
                operation,
                status,
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Transient { .. } => ErrorKind::TransientApi,
            Self::Api { .. } => ErrorKind::Api,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::OrchestrationConfig(_) => ErrorKind::OrchestrationConfig,
            Self::Source { .. } => ErrorKind::Source,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RunAborted { source, .. } => source.kind(),
        }
    }

    /// Default retry classification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimitExceeded { .. })
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } | Self::RateLimitExceeded { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Errors that must stop a whole run instead of being isolated per record.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::Authentication { .. } | Self::Cancelled
        )
    }

    /// Errors that should page someone rather than wait for the next run.
    pub fn triggers_alert(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Authentication { .. })
    }
}

/// Flat error category for audit entries, per-record errors and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimit,
    CircuitOpen,
    TransientApi,
    Api,
    Authentication,
    OrchestrationConfig,
    Source,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::CircuitOpen => "circuit_open",
            Self::TransientApi => "transient_api",
            Self::Api => "api",
            Self::Authentication => "authentication",
            Self::OrchestrationConfig => "orchestration_config",
            Self::Source => "source",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
