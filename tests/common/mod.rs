//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use resilient_sync::client::{AuditedApiClient, MemoryAuditSink};
use resilient_sync::resilience::{CircuitBreaker, RetryPolicy};
use resilient_sync::store::{MemoryRecordStore, Record};

pub struct Harness {
    pub store: Arc<MemoryRecordStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub client: Arc<AuditedApiClient>,
}

/// Client over an in-memory store with fast, jitter-free retries.
pub fn harness(rate_limit: u32, failure_threshold: u32, max_attempts: u32) -> Harness {
    let store = Arc::new(MemoryRecordStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let client = Arc::new(
        AuditedApiClient::new(store.clone())
            .with_rate_limit(rate_limit)
            .with_circuit_breaker(CircuitBreaker::new(failure_threshold, Duration::from_secs(60)))
            .with_retry_policy(
                RetryPolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(100))
                    .with_jitter(0.0),
            )
            .with_timeout(Duration::from_secs(5))
            .with_audit_sink(audit.clone()),
    );
    Harness { store, audit, client }
}

pub fn rec(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}
