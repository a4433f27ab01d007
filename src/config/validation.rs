//! Configuration validation.
//!
//! Semantic checks only; serde handles syntax. Every problem is collected so
//! the operator sees the whole list at once. Dependency cycles are left to the
//! orchestrator, which rejects them before any job runs.

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::SyncConfig;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Upper bound on the limiter ceiling; the store allows far less.
pub const MAX_REQUESTS_PER_SECOND: u32 = 1000;

/// Validate a parsed configuration.
pub fn validate_config(config: &SyncConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.rate_limit.requests_per_second == 0 {
        errors.push(ValidationError::new("rate_limit.requests_per_second", "must be > 0"));
    } else if config.rate_limit.requests_per_second > MAX_REQUESTS_PER_SECOND {
        errors.push(ValidationError::new(
            "rate_limit.requests_per_second",
            format!("must be <= {}", MAX_REQUESTS_PER_SECOND),
        ));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }
    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be > 0"));
    }
    if config.circuit_breaker.reopen_backoff_multiplier < 1.0 {
        errors.push(ValidationError::new(
            "circuit_breaker.reopen_backoff_multiplier",
            "must be >= 1.0",
        ));
    }
    if config.circuit_breaker.max_cooldown_secs < config.circuit_breaker.cooldown_secs {
        errors.push(ValidationError::new(
            "circuit_breaker.max_cooldown_secs",
            "must be >= cooldown_secs",
        ));
    }
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be > 0"));
    }
    if config.retries.max_delay_ms < config.retries.base_delay_ms {
        errors.push(ValidationError::new("retries.max_delay_ms", "must be >= base_delay_ms"));
    }
    if !(0.0..=1.0).contains(&config.retries.jitter_ratio) {
        errors.push(ValidationError::new("retries.jitter_ratio", "must be within 0.0..=1.0"));
    }
    if config.store.page_size == 0 || config.store.page_size > 100 {
        errors.push(ValidationError::new("store.page_size", "must be within 1..=100"));
    }
    if url::Url::parse(&config.store.base_url).is_err() {
        errors.push(ValidationError::new(
            "store.base_url",
            format!("'{}' is not a valid URL", config.store.base_url),
        ));
    }
    if config.health.interval_secs == 0 {
        errors.push(ValidationError::new("health.interval_secs", "must be > 0"));
    }
    if config.health.timeout_secs == 0 {
        errors.push(ValidationError::new("health.timeout_secs", "must be > 0"));
    }
    if config.health.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new("health.bind_address", "must be host:port"));
    }
    for (probe, weight) in &config.health.weights {
        if *weight < 0.0 {
            errors.push(ValidationError::new(format!("health.weights.{}", probe), "must be >= 0"));
        }
    }

    let declared: HashSet<&str> = config.jobs.iter().map(|j| j.entity_type.as_str()).collect();
    let mut seen = HashSet::new();

    for (i, job) in config.jobs.iter().enumerate() {
        let path = format!("jobs[{}]", i);
        if job.entity_type.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.entity_type", path), "must not be empty"));
        }
        if !seen.insert(job.entity_type.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.entity_type", path),
                format!("duplicate job '{}'", job.entity_type),
            ));
        }
        if job.upsert_key.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.upsert_key", path), "must not be empty"));
        }
        for dep in &job.depends_on {
            if !declared.contains(dep.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.depends_on", path),
                    format!("unknown job '{}'", dep),
                ));
            }
        }
        for relation in &job.relations {
            if !job.depends_on.contains(&relation.entity_type) {
                errors.push(ValidationError::new(
                    format!("{}.relations.{}", path, relation.field),
                    format!("'{}' must be listed in depends_on", relation.entity_type),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
