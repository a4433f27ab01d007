//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the sync core.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Outbound request ceiling.
    pub rate_limit: RateLimitConfig,

    /// Per-call deadlines.
    pub timeouts: TimeoutConfig,

    /// Breaker thresholds and cooldowns.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Pacing between record writes.
    pub batch: BatchConfig,

    /// Downstream record store.
    pub store: StoreConfig,

    /// Upstream record source.
    pub source: SourceConfig,

    /// Health probes and endpoints.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Where the last run report and checkpoints are persisted.
    pub state_file: Option<String>,

    /// Sync job declarations.
    pub jobs: Vec<JobConfig>,
}

/// Whether limiter windows are shared or tracked per operation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    Global,
    PerOperation,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum calls started within any one-second window.
    pub requests_per_second: u32,

    pub scope: RateLimitScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 3,
            scope: RateLimitScope::Global,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for a single network call in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Base cooldown before a trial call is allowed.
    pub cooldown_secs: u64,

    /// Cooldown multiplier applied on each failed trial.
    pub reopen_backoff_multiplier: f64,

    /// Upper bound for the grown cooldown.
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            reopen_backoff_multiplier: 2.0,
            max_cooldown_secs: 600,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per logical call, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay (0.1 = up to +10%).
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Write pacing.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause after each record upsert in milliseconds.
    pub delay_ms: u64,
}

/// Downstream store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the REST API.
    pub base_url: String,

    /// Environment variable holding the bearer token.
    pub token_env: String,

    /// Value sent in the version header.
    pub api_version: String,

    /// Items requested per query page (the API caps this at 100).
    pub page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.notion.com".to_string(),
            token_env: "NOTION_TOKEN".to_string(),
            api_version: "2022-06-28".to_string(),
            page_size: 100,
        }
    }
}

/// Which source implementation the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A directory of `<entity_type>.json` arrays.
    #[default]
    JsonDir,
    /// No records (useful for health-only deployments).
    Empty,
}

/// Upstream source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::JsonDir,
            path: "./data".to_string(),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe interval in seconds for the background loop.
    pub interval_secs: u64,

    /// Timeout for a single probe in seconds.
    pub timeout_secs: u64,

    /// Bind address for the health endpoints.
    pub bind_address: String,

    /// Directory checked by the disk probe.
    pub disk_path: String,

    /// Minimum free disk percentage before the disk probe fails.
    pub min_free_disk_percent: f64,

    /// Minimum available memory percentage before the memory probe fails.
    pub min_free_memory_percent: f64,

    /// Per-probe weights for the health score (missing = 1.0).
    pub weights: HashMap<String, f64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            bind_address: "127.0.0.1:9091".to_string(),
            disk_path: ".".to_string(),
            min_free_disk_percent: 10.0,
            min_free_memory_percent: 5.0,
            weights: HashMap::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output.
    pub json_logs: bool,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A relation field whose values are upsert keys of another entity type.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RelationConfig {
    pub field: String,
    pub entity_type: String,
}

/// One sync job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Entity type fetched from the source.
    pub entity_type: String,

    /// Target collection id (defaults to the entity type).
    #[serde(default)]
    pub collection: Option<String>,

    /// Entity types that must be synced first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Field holding the stable logical key.
    pub upsert_key: String,

    /// Source field → target property renames.
    #[serde(default)]
    pub field_map: HashMap<String, String>,

    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}
