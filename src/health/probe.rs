//! Health probes.
//!
//! A probe answers one question about one dependency. It does not time
//! itself or enforce a deadline; the aggregator does both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};

use crate::client::AuditedApiClient;
use crate::correlation::CorrelationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Pass,
    Fail,
}

/// Result of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub component: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.status == ProbeStatus::Pass
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Mandatory probes gate readiness; optional ones only degrade.
    fn mandatory(&self) -> bool {
        true
    }

    /// `Ok` with an optional detail on pass, `Err` with the reason on fail.
    async fn check(&self) -> Result<Option<String>, String>;
}

/// Free space on the filesystem holding `path`.
#[derive(Debug, Clone)]
pub struct DiskProbe {
    path: PathBuf,
    min_free_percent: f64,
}

impl DiskProbe {
    pub fn new(path: impl Into<PathBuf>, min_free_percent: f64) -> Self {
        Self {
            path: path.into(),
            min_free_percent,
        }
    }
}

fn free_disk_percent(path: &Path) -> Option<f64> {
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()) && d.total_space() > 0)
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / d.total_space() as f64 * 100.0)
}

#[async_trait]
impl HealthProbe for DiskProbe {
    fn name(&self) -> &str {
        "disk"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let path = self.path.clone();
        let free = tokio::task::spawn_blocking(move || free_disk_percent(&path))
            .await
            .map_err(|e| format!("disk probe task failed: {}", e))?;

        match free {
            None => Ok(Some("no filesystem information available".to_string())),
            Some(free) if free < self.min_free_percent => Err(format!(
                "{:.1}% free, below {:.1}%",
                free, self.min_free_percent
            )),
            Some(free) => Ok(Some(format!("{:.1}% free", free))),
        }
    }
}

/// Available system memory.
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    min_free_percent: f64,
    mandatory: bool,
}

impl MemoryProbe {
    pub fn new(min_free_percent: f64) -> Self {
        Self {
            min_free_percent,
            mandatory: false,
        }
    }

    /// Make low memory fail readiness instead of only degrading.
    pub fn required(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn name(&self) -> &str {
        "memory"
    }

    fn mandatory(&self) -> bool {
        self.mandatory
    }

    async fn check(&self) -> Result<Option<String>, String> {
        // sysinfo blocks while reading /proc
        let (available, total) = tokio::task::spawn_blocking(|| {
            let mut system = System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            );
            system.refresh_memory();
            (system.available_memory(), system.total_memory())
        })
        .await
        .map_err(|e| format!("memory probe task failed: {}", e))?;

        if total == 0 {
            return Ok(Some("no memory information available".to_string()));
        }
        let free = available as f64 / total as f64 * 100.0;
        if free < self.min_free_percent {
            return Err(format!("{:.1}% available, below {:.1}%", free, self.min_free_percent));
        }
        Ok(Some(format!("{:.1}% available", free)))
    }
}

/// Reachability of the downstream store through the audited client.
#[derive(Debug, Clone)]
pub struct ApiProbe {
    name: String,
    client: Arc<AuditedApiClient>,
}

impl ApiProbe {
    pub fn new(name: impl Into<String>, client: Arc<AuditedApiClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl HealthProbe for ApiProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let correlation_id = CorrelationId::new().child("health");
        self.client
            .ping(&correlation_id)
            .await
            .map(|_| None)
            .map_err(|e| format!("{}: {}", e.kind(), e))
    }
}

type CheckFn = dyn Fn() -> Result<Option<String>, String> + Send + Sync;

/// Probe backed by a closure.
pub struct FnProbe {
    name: String,
    mandatory: bool,
    check: Box<CheckFn>,
}

impl FnProbe {
    pub fn new<F>(name: impl Into<String>, mandatory: bool, check: F) -> Self
    where
        F: Fn() -> Result<Option<String>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mandatory,
            check: Box::new(check),
        }
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn mandatory(&self) -> bool {
        self.mandatory
    }

    async fn check(&self) -> Result<Option<String>, String> {
        (self.check)()
    }
}

impl std::fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProbe")
            .field("name", &self.name)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryRecordStore, StoreOp};

    #[tokio::test]
    async fn test_disk_probe_with_zero_threshold_passes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskProbe::new(dir.path(), 0.0).check().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_probe_is_optional_by_default() {
        let probe = MemoryProbe::new(0.0);
        assert!(!probe.mandatory());
        assert!(probe.check().await.is_ok());
        assert!(MemoryProbe::new(0.0).required(true).mandatory());
    }

    #[tokio::test]
    async fn test_api_probe_reports_store_failures() {
        let store = Arc::new(MemoryRecordStore::new());
        let client = Arc::new(AuditedApiClient::new(store.clone()).with_rate_limit(100));
        let probe = ApiProbe::new("store", client);
        assert!(probe.check().await.is_ok());

        store.inject(StoreOp::Ping, Fault::Status(401), 1);
        let reason = probe.check().await.unwrap_err();
        assert!(reason.starts_with("authentication"), "{}", reason);
        assert_eq!(store.calls(StoreOp::Ping), 2);
    }
}
