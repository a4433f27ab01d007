//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::SyncConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<SyncConfig, ConfigError> {
    let config: SyncConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<SyncConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RateLimitScope;
    use std::io::Write;

    const SAMPLE: &str = r#"
state_file = "state.json"

[rate_limit]
requests_per_second = 3
scope = "per_operation"

[circuit_breaker]
failure_threshold = 3

[[jobs]]
entity_type = "customers"
upsert_key = "customer_id"

[[jobs]]
entity_type = "devices"
collection = "db-devices"
depends_on = ["customers"]
upsert_key = "serial"
relations = [{ field = "customer", entity_type = "customers" }]

[jobs.field_map]
hostname = "Name"
"#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.rate_limit.scope, RateLimitScope::PerOperation);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        // untouched sections keep their defaults
        assert_eq!(config.circuit_breaker.cooldown_secs, 60);
        assert_eq!(config.retries.max_attempts, 3);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[1].collection.as_deref(), Some("db-devices"));
        assert_eq!(config.jobs[1].field_map.get("hostname").map(String::as_str), Some("Name"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.state_file.as_deref(), Some("state.json"));
    }

    #[test]
    fn test_validation_error_surfaces() {
        let err = parse_config("[retries]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("retries.max_attempts"));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse_config("[rate_limit"), Err(ConfigError::Parse(_))));
    }
}
