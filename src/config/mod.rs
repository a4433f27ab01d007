//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SyncConfig (validated, immutable)
//!     → lifecycle/startup.rs hands plain values to each component
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BatchConfig, CircuitBreakerConfig, HealthConfig, JobConfig, ObservabilityConfig,
    RateLimitConfig, RateLimitScope, RelationConfig, RetryConfig, SourceConfig, SourceKind,
    StoreConfig, SyncConfig, TimeoutConfig,
};
