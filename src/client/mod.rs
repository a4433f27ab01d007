//! Audited API client.
//!
//! # Data Flow
//! ```text
//! sync/orchestrator.rs ──find_or_create──▶ audited.rs
//!                                             ├─ validation.rs (reject / sanitize)
//!                                             ├─ resilience/   (limiter → breaker → retry → timeout)
//!                                             ├─ store/        (query, create, update)
//!                                             └─ audit.rs      (one entry per logical operation)
//! health/probe.rs ──ping──▶ audited.rs
//! ```

pub mod audit;
pub mod audited;
pub mod validation;

pub use audit::{AuditLogEntry, AuditOutcome, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use audited::{AuditedApiClient, UpsertAction, UpsertOutcome};
