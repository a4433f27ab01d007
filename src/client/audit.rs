//! Audit log entries and sinks.
//!
//! Entries are produced once per logical mutating operation, at the point
//! where it definitively succeeds, fails, or is short-circuited. Storage is
//! the sink's concern.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::ErrorKind;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Append-only record of one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub target: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl AuditLogEntry {
    pub fn new(
        correlation_id: &CorrelationId,
        operation: impl Into<String>,
        target: impl Into<String>,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.clone(),
            operation: operation.into(),
            target: target.into(),
            outcome: if error_kind.is_some() {
                AuditOutcome::Failure
            } else {
                AuditOutcome::Success
            },
            error_kind,
        }
    }
}

/// Receives audit entries. Implementations must not block for long.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditLogEntry);
}

/// Writes entries as structured events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        metrics::record_audit(entry.outcome.as_str());
        tracing::info!(
            target: "audit",
            timestamp = %entry.timestamp.to_rfc3339(),
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            target_record = %entry.target,
            outcome = entry.outcome.as_str(),
            error_kind = entry.error_kind.map(|k| k.as_str()).unwrap_or(""),
            "audit"
        );
    }
}

/// Keeps entries in memory; handy for tests and run summaries.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_follows_error_kind() {
        let cid = CorrelationId::from("run-1");
        let ok = AuditLogEntry::new(&cid, "find_or_create", "devices/SN-1", None);
        let failed = AuditLogEntry::new(&cid, "find_or_create", "devices/SN-2", Some(ErrorKind::CircuitOpen));
        assert_eq!(ok.outcome, AuditOutcome::Success);
        assert_eq!(failed.outcome, AuditOutcome::Failure);

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["error_kind"], "circuit_open");
        assert_eq!(json["correlation_id"], "run-1");
        assert!(serde_json::to_value(&ok).unwrap().get("error_kind").is_none());
    }

    #[test]
    fn test_memory_sink_appends() {
        let sink = MemoryAuditSink::new();
        let cid = CorrelationId::new();
        sink.record(AuditLogEntry::new(&cid, "op", "t", None));
        sink.record(AuditLogEntry::new(&cid, "op", "t", None));
        assert_eq!(sink.len(), 2);
    }
}
