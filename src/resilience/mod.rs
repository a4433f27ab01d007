//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to the downstream store (composed in client/audited.rs):
//!     → rate_limit.rs (block until a slot is free)
//!     → circuit_breaker.rs (fail fast while open, one trial when half-open)
//!     → retries.rs (retry transient failures with backoff.rs delays)
//!         → timeouts.rs (deadline on each attempt)
//! ```
//!
//! # Design Decisions
//! - Each primitive is an explicit object taking the call as a parameter
//! - Breaker and limiter state is keyed by operation and owned by the client
//! - The limiter only delays; it never rejects

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitSnapshot};
pub use rate_limit::RateLimiter;
pub use retries::{default_classifier, ErrorClass, RetryAttempt, RetryPolicy};
