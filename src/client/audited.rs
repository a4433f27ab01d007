//! Audited API client.
//!
//! # Call Composition
//! ```text
//! find_or_create(collection, key_field, key, payload, correlation_id)
//!     → validation.rs (identifiers, markup, array and payload limits)
//!     → guarded("{collection}.query"), once per result page
//!     → guarded("{collection}.update") | guarded("{collection}.create")
//!     → one AuditLogEntry with the final outcome
//!
//! guarded(operation, call):
//!     RateLimiter::acquire
//!         → CircuitBreaker::call
//!             → RetryPolicy::execute (limiter slot re-acquired per retry)
//!                 → with_timeout(call(attempt))
//! ```
//!
//! Creates are idempotent under retry: any create attempt after the first
//! re-queries the key, so a write whose response was lost is not repeated.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use crate::client::audit::{AuditLogEntry, AuditSink, TracingAuditSink};
use crate::client::validation::{prepare_upsert, validate_identifier};
use crate::config::{RateLimitScope, SyncConfig};
use crate::correlation::CorrelationId;
use crate::error::{SyncError, SyncResult};
use crate::resilience::timeouts::with_timeout;
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::store::{Record, RecordStore, RemoteRecord};

const FIND_OR_CREATE: &str = "find_or_create";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

/// What `find_or_create` did for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertOutcome {
    pub id: String,
    pub action: UpsertAction,
}

/// Resilient, audited access to a `RecordStore`.
pub struct AuditedApiClient {
    store: Arc<dyn RecordStore>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    audit: Arc<dyn AuditSink>,
}

impl AuditedApiClient {
    /// Client with default limits (3 req/s, 5 failures, 3 attempts, 30s).
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::from_config(store, &SyncConfig::default())
    }

    pub fn from_config(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            limiter: RateLimiter::from_config(&config.rate_limit),
            breaker: CircuitBreaker::from_config(&config.circuit_breaker),
            retry: RetryPolicy::from_config(&config.retries),
            timeout: Duration::from_secs(config.timeouts.request_secs),
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_rate_limit(self, limit_per_second: u32) -> Self {
        self.with_rate_limiter(RateLimiter::new(limit_per_second, RateLimitScope::Global))
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one logical call through limiter, breaker, retry and timeout.
    async fn guarded<T, F, Fut>(&self, operation: &str, call: F) -> SyncResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.limiter.acquire(operation).await;
        self.breaker
            .call(operation, || {
                self.retry.execute(operation, |attempt| {
                    let fut = call(attempt);
                    async move {
                        if attempt > 1 {
                            self.limiter.acquire(operation).await;
                        }
                        with_timeout(operation, self.timeout, fut).await
                    }
                })
            })
            .await
    }

    /// Keyed query with every page as its own guarded call.
    async fn lookup(
        &self,
        operation: &str,
        collection: &str,
        key_field: &str,
        key: &str,
    ) -> SyncResult<Option<RemoteRecord>> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .guarded(operation, |_| {
                    self.store.query_page(collection, key_field, key, cursor.as_deref())
                })
                .await?;
            if page.found.is_some() {
                return Ok(page.found);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Keyed query inside an attempt that is already guarded: only paced.
    async fn scan(
        &self,
        operation: &str,
        collection: &str,
        key_field: &str,
        key: &str,
    ) -> SyncResult<Option<RemoteRecord>> {
        let mut cursor: Option<String> = None;
        loop {
            self.limiter.acquire(operation).await;
            let page = self
                .store
                .query_page(collection, key_field, key, cursor.as_deref())
                .await?;
            if page.found.is_some() {
                return Ok(page.found);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Look up a record by key without mutating anything.
    pub async fn find(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        correlation_id: &CorrelationId,
    ) -> SyncResult<Option<RemoteRecord>> {
        validate_identifier("collection", collection)?;
        validate_identifier(key_field, key)?;

        let operation = format!("{}.query", collection);
        let span = tracing::debug_span!("find", correlation_id = %correlation_id, operation = %operation);
        self.lookup(&operation, collection, key_field, key)
            .instrument(span)
            .await
    }

    /// Single-attempt reachability check through the limiter and breaker.
    pub async fn ping(&self, correlation_id: &CorrelationId) -> SyncResult<()> {
        let operation = "store.ping";
        self.limiter.acquire(operation).await;
        self.breaker
            .call(operation, || with_timeout(operation, self.timeout, self.store.ping()))
            .instrument(tracing::debug_span!("ping", correlation_id = %correlation_id))
            .await
    }

    /// Update the record whose `key_field` equals `key`, or create it.
    ///
    /// Emits exactly one audit entry, whatever the outcome.
    pub async fn find_or_create(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        payload: &Record,
        correlation_id: &CorrelationId,
    ) -> SyncResult<UpsertOutcome> {
        let span = tracing::info_span!(
            "find_or_create",
            correlation_id = %correlation_id,
            collection = %collection,
            key = %key
        );
        let result = self
            .upsert(collection, key_field, key, payload)
            .instrument(span)
            .await;

        let target = format!("{}/{}", collection, key);
        let entry = AuditLogEntry::new(
            correlation_id,
            FIND_OR_CREATE,
            target.as_str(),
            result.as_ref().err().map(SyncError::kind),
        );
        self.audit.record(entry);

        if let Err(e) = &result {
            if e.triggers_alert() {
                tracing::error!(
                    target: "alert",
                    correlation_id = %correlation_id,
                    operation = FIND_OR_CREATE,
                    target_record = %target,
                    error_kind = %e.kind(),
                    error = %e,
                    "Sync dependency needs attention"
                );
            }
        }
        result
    }

    async fn upsert(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        payload: &Record,
    ) -> SyncResult<UpsertOutcome> {
        let fields = &prepare_upsert(collection, key_field, key, payload)?;

        let query_op = format!("{}.query", collection);
        let existing = self
            .lookup(&query_op, collection, key_field, key)
            .await?;

        if let Some(existing) = existing {
            let update_op = format!("{}.update", collection);
            let id = existing.id.as_str();
            let updated = self
                .guarded(&update_op, |_| self.store.update(collection, id, fields))
                .await?;
            tracing::debug!(id = %updated.id, "Updated existing record");
            return Ok(UpsertOutcome {
                id: updated.id,
                action: UpsertAction::Updated,
            });
        }

        let create_op = format!("{}.create", collection);
        let query_op = query_op.as_str();
        let created = self
            .guarded(&create_op, |attempt| async move {
                if attempt > 1 {
                    // an earlier attempt may have committed before its response was lost
                    if let Some(found) = self.scan(query_op, collection, key_field, key).await? {
                        tracing::info!(id = %found.id, attempt, "Create already committed, not repeating");
                        return Ok(found);
                    }
                }
                self.store.create(collection, fields).await
            })
            .await?;

        tracing::debug!(id = %created.id, "Created record");
        Ok(UpsertOutcome {
            id: created.id,
            action: UpsertAction::Created,
        })
    }
}

impl std::fmt::Debug for AuditedApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditedApiClient")
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::audit::{AuditOutcome, MemoryAuditSink};
    use crate::error::ErrorKind;
    use crate::resilience::BreakerState;
    use crate::store::{Fault, MemoryRecordStore, StoreOp};
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryRecordStore>,
        audit: Arc<MemoryAuditSink>,
        client: AuditedApiClient,
    }

    fn harness(threshold: u32, attempts: u32) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let client = AuditedApiClient::new(store.clone())
            .with_rate_limit(1000)
            .with_circuit_breaker(CircuitBreaker::new(threshold, Duration::from_secs(60)))
            .with_retry_policy(
                RetryPolicy::new(attempts, Duration::from_millis(10), Duration::from_millis(100))
                    .with_jitter(0.0),
            )
            .with_timeout(Duration::from_secs(5))
            .with_audit_sink(audit.clone());
        Harness { store, audit, client }
    }

    fn payload() -> Record {
        json!({"Name": "edge-01", "os": "<b>Windows</b>"}).as_object().cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_or_create_is_idempotent() {
        let h = harness(5, 3);
        let cid = CorrelationId::new();

        let first = h.client.find_or_create("devices", "serial", "SN-1", &payload(), &cid).await.unwrap();
        let second = h.client.find_or_create("devices", "serial", "SN-1", &payload(), &cid).await.unwrap();

        assert_eq!(first.action, UpsertAction::Created);
        assert_eq!(second.action, UpsertAction::Updated);
        assert_eq!(first.id, second.id);

        let records = h.store.records("devices");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["os"], "Windows");
        assert_eq!(records[0].fields["serial"], "SN-1");
        assert_eq!(h.audit.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_create_response_is_not_repeated() {
        let h = harness(5, 3);
        h.store.inject(StoreOp::Create, Fault::CommitThenTimeout, 1);

        let outcome = h
            .client
            .find_or_create("devices", "serial", "SN-2", &payload(), &CorrelationId::new())
            .await
            .unwrap();

        assert_eq!(outcome.action, UpsertAction::Created);
        assert_eq!(h.store.records("devices").len(), 1);
        assert_eq!(h.store.calls(StoreOp::Create), 1);
        assert_eq!(h.audit.len(), 1, "one entry per logical operation, not per attempt");
        assert_eq!(h.audit.entries()[0].outcome, AuditOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_then_audited_once() {
        let h = harness(5, 3);
        h.store.inject(StoreOp::Query, Fault::Status(503), 2);

        let outcome = h
            .client
            .find_or_create("devices", "serial", "SN-3", &payload(), &CorrelationId::new())
            .await
            .unwrap();
        assert_eq!(outcome.action, UpsertAction::Created);
        assert_eq!(h.store.calls(StoreOp::Query), 3);
        assert_eq!(h.audit.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_makes_no_calls() {
        let h = harness(5, 3);
        let cid = CorrelationId::from("run-7");
        let err = h.client.find_or_create("devices", "serial", "", &payload(), &cid).await.unwrap_err();

        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(h.store.total_calls(), 0);
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_kind, Some(ErrorKind::Validation));
        assert_eq!(entries[0].correlation_id, cid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_not_retried() {
        let h = harness(5, 3);
        h.store.inject_always(StoreOp::Query, Fault::Status(401));

        let err = h
            .client
            .find_or_create("devices", "serial", "SN-4", &payload(), &CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Authentication { .. }));
        assert_eq!(h.store.calls(StoreOp::Query), 1);
        assert_eq!(h.audit.entries()[0].error_kind, Some(ErrorKind::Authentication));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_and_is_audited() {
        let h = harness(2, 1);
        h.store.inject_always(StoreOp::Query, Fault::Status(500));
        let cid = CorrelationId::new();

        for _ in 0..2 {
            let err = h.client.find_or_create("devices", "serial", "SN-5", &payload(), &cid).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TransientApi);
        }
        assert_eq!(h.client.breaker().state("devices.query"), BreakerState::Open);

        let err = h.client.find_or_create("devices", "serial", "SN-5", &payload(), &cid).await.unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
        assert_eq!(h.store.calls(StoreOp::Query), 2);

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].error_kind, Some(ErrorKind::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_and_ping() {
        let h = harness(5, 3);
        let cid = CorrelationId::new();
        h.store.seed("devices", json!({"serial": "SN-9"}).as_object().cloned().unwrap());

        assert!(h.client.find("devices", "serial", "SN-9", &cid).await.unwrap().is_some());
        assert!(h.client.find("devices", "serial", "SN-0", &cid).await.unwrap().is_none());
        assert!(h.client.ping(&cid).await.is_ok());
        assert!(h.audit.is_empty(), "reads are not audited");
    }
}
