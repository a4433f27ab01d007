//! Resilient batch synchronization into a rate-limited REST store.
//!
//! Records flow from a [`sync::RecordSource`] through the
//! [`sync::SyncOrchestrator`] (dependency order, relation resolution) into
//! the [`client::AuditedApiClient`], which wraps every store call in the
//! rate limiter, circuit breaker, retry policy and deadline from
//! [`resilience`]. The [`health`] aggregator probes the same client.

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod store;
pub mod sync;

pub use client::AuditedApiClient;
pub use config::SyncConfig;
pub use correlation::CorrelationId;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use health::HealthAggregator;
pub use lifecycle::Shutdown;
pub use sync::{SyncOptions, SyncOrchestrator, SyncReport};
