//! Upstream record sources.
//!
//! Sources only yield records; they never write. `fetch_changed` lets a
//! source skip records untouched since the last successful sync. Records
//! without a parseable `updated_at` are always considered changed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{SyncError, SyncResult};
use crate::store::Record;

const UPDATED_AT: &str = "updated_at";

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Every record of `entity_type`.
    async fn fetch(&self, entity_type: &str) -> SyncResult<Vec<Record>>;

    /// Records of `entity_type` changed at or after `since`.
    async fn fetch_changed(&self, entity_type: &str, since: DateTime<Utc>) -> SyncResult<Vec<Record>> {
        let _ = since;
        self.fetch(entity_type).await
    }
}

fn changed_since(records: Vec<Record>, since: DateTime<Utc>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| {
            r.get(UPDATED_AT)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc) >= since)
                .unwrap_or(true)
        })
        .collect()
}

/// Records held in memory, keyed by entity type.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    records: HashMap<String, Vec<Record>>,
    failures: HashMap<String, String>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, entity_type: impl Into<String>, records: Vec<Record>) -> Self {
        self.records.insert(entity_type.into(), records);
        self
    }

    /// Make every fetch of `entity_type` fail.
    pub fn failing(mut self, entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(entity_type.into(), message.into());
        self
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    async fn fetch(&self, entity_type: &str) -> SyncResult<Vec<Record>> {
        if let Some(message) = self.failures.get(entity_type) {
            return Err(SyncError::Source {
                entity_type: entity_type.to_string(),
                message: message.clone(),
            });
        }
        Ok(self.records.get(entity_type).cloned().unwrap_or_default())
    }

    async fn fetch_changed(&self, entity_type: &str, since: DateTime<Utc>) -> SyncResult<Vec<Record>> {
        Ok(changed_since(self.fetch(entity_type).await?, since))
    }
}

/// Reads `<dir>/<entity_type>.json`, a JSON array of objects.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn source_error(entity_type: &str, message: impl Into<String>) -> SyncError {
        SyncError::Source {
            entity_type: entity_type.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl RecordSource for JsonDirSource {
    async fn fetch(&self, entity_type: &str) -> SyncResult<Vec<Record>> {
        let path = self.dir.join(format!("{}.json", entity_type));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(entity_type = %entity_type, path = %path.display(), "No source file, nothing to sync");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Self::source_error(entity_type, format!("{}: {}", path.display(), e)));
            }
        };

        let value: Value = serde_json::from_str(&content)
            .map_err(|e| Self::source_error(entity_type, format!("{}: {}", path.display(), e)))?;
        let Value::Array(items) = value else {
            return Err(Self::source_error(entity_type, "expected a JSON array of objects"));
        };

        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(record) => Ok(record),
                _ => Err(Self::source_error(entity_type, format!("item {} is not an object", i))),
            })
            .collect()
    }

    async fn fetch_changed(&self, entity_type: &str, since: DateTime<Utc>) -> SyncResult<Vec<Record>> {
        Ok(changed_since(self.fetch(entity_type).await?, since))
    }
}

/// Yields nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySource;

#[async_trait]
impl RecordSource for EmptySource {
    async fn fetch(&self, _entity_type: &str) -> SyncResult<Vec<Record>> {
        Ok(Vec::new())
    }
}

/// Build the configured source.
pub fn source_from_config(config: &SourceConfig) -> Arc<dyn RecordSource> {
    match config.kind {
        SourceKind::JsonDir => Arc::new(JsonDirSource::new(&config.path)),
        SourceKind::Empty => Arc::new(EmptySource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_json_dir_source_reads_arrays() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("clients.json"),
            r#"[{"name": "Acme"}, {"name": "Globex"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), r#"{"name": "x"}"#).unwrap();

        let source = JsonDirSource::new(dir.path());
        assert_eq!(source.fetch("clients").await.unwrap().len(), 2);
        assert!(source.fetch("missing").await.unwrap().is_empty());
        assert!(matches!(source.fetch("broken").await, Err(SyncError::Source { .. })));
    }

    #[tokio::test]
    async fn test_fetch_changed_filters_on_updated_at() {
        let source = StaticSource::new().with_records(
            "devices",
            vec![
                rec(json!({"serial": "old", "updated_at": "2024-01-01T00:00:00Z"})),
                rec(json!({"serial": "new", "updated_at": "2024-06-01T00:00:00Z"})),
                rec(json!({"serial": "unknown"})),
            ],
        );
        let since = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let changed = source.fetch_changed("devices", since).await.unwrap();
        let serials: Vec<_> = changed.iter().map(|r| r["serial"].as_str().unwrap()).collect();
        assert_eq!(serials, vec!["new", "unknown"]);
    }

    #[tokio::test]
    async fn test_failing_and_empty_sources() {
        let source = StaticSource::new().failing("tickets", "psa unreachable");
        assert!(matches!(source.fetch("tickets").await, Err(SyncError::Source { .. })));
        assert!(EmptySource.fetch("anything").await.unwrap().is_empty());
    }
}
