//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer (aggregator.rs::run) or HTTP request (server.rs)
//!     → probe.rs   disk, memory, store ping; each under a deadline
//!     → aggregator.rs
//!         → overall status, weighted score, cached snapshot
//!         → liveness / readiness / metrics snapshot
//! ```
//!
//! # Design Decisions
//! - Liveness never runs probes
//! - Only mandatory probes gate readiness
//! - Probing goes through the audited client, so it shares limiter and breaker

pub mod aggregator;
pub mod probe;
pub mod server;

pub use aggregator::{
    overall_status, render_prometheus, ComponentMetric, HealthAggregator, HealthSnapshot, Liveness,
    MetricsSnapshot, OverallStatus, Readiness,
};
pub use probe::{ApiProbe, DiskProbe, FnProbe, HealthProbe, HealthReport, MemoryProbe, ProbeStatus};
