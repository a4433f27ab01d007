//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, correlation ids as fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Prometheus exporter (optional)
//!     → health/aggregator.rs metrics snapshot (SyncCounters)
//! ```

pub mod logging;
pub mod metrics;
