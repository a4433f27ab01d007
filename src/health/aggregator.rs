//! Health aggregation.
//!
//! # Aggregation Rule
//! ```text
//! every probe passes             → Healthy
//! only optional probes fail      → Degraded
//! any mandatory probe fails      → Unhealthy (not ready)
//! ```
//!
//! Probes run concurrently, each under its own deadline. The latest snapshot
//! is cached; readiness reuses it while it is younger than `max_age`.
//! The aggregator never touches breaker or limiter state itself.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::AuditedApiClient;
use crate::config::HealthConfig;
use crate::health::probe::{ApiProbe, DiskProbe, HealthProbe, HealthReport, MemoryProbe, ProbeStatus};
use crate::observability::metrics::{self, SyncCounters};
use crate::resilience::{BreakerState, CircuitSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// All probe results from one round.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    /// Weighted share of passing probes, 0-100.
    pub score: f64,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<HealthReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub status: ProbeStatus,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub status: OverallStatus,
    /// Mandatory components currently failing.
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentMetric {
    pub component: String,
    pub healthy: bool,
    pub latency_ms: u64,
}

/// Counters and per-component gauges.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_sync_operations: u64,
    pub total_sync_errors: u64,
    pub total_sync_runs: u64,
    pub health_score: Option<f64>,
    pub components: Vec<ComponentMetric>,
    pub circuits: Vec<CircuitSnapshot>,
}

struct Cached {
    snapshot: HealthSnapshot,
    at: Instant,
}

pub struct HealthAggregator {
    probes: Vec<Arc<dyn HealthProbe>>,
    weights: HashMap<String, f64>,
    probe_timeout: Duration,
    max_age: Duration,
    counters: Arc<SyncCounters>,
    client: Option<Arc<AuditedApiClient>>,
    latest: RwLock<Option<Cached>>,
    started: Instant,
}

impl HealthAggregator {
    pub fn new(probe_timeout: Duration, counters: Arc<SyncCounters>) -> Self {
        Self {
            probes: Vec::new(),
            weights: HashMap::new(),
            probe_timeout,
            max_age: Duration::from_secs(30),
            counters,
            client: None,
            latest: RwLock::new(None),
            started: Instant::now(),
        }
    }

    /// Disk, memory and store probes as configured.
    pub fn from_config(config: &HealthConfig, client: Arc<AuditedApiClient>, counters: Arc<SyncCounters>) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs), counters)
            .with_max_age(Duration::from_secs(config.interval_secs))
            .with_weights(config.weights.clone())
            .with_probe(DiskProbe::new(&config.disk_path, config.min_free_disk_percent))
            .with_probe(MemoryProbe::new(config.min_free_memory_percent))
            .with_probe(ApiProbe::new("store", client.clone()))
            .with_client(client)
    }

    pub fn with_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probes.push(Arc::new(probe));
        self
    }

    pub fn with_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Include this client's breaker states in metrics snapshots.
    pub fn with_client(mut self, client: Arc<AuditedApiClient>) -> Self {
        self.client = Some(client);
        self
    }

    fn weight(&self, component: &str) -> f64 {
        self.weights.get(component).copied().unwrap_or(1.0).max(0.0)
    }

    /// Run every probe now and cache the result.
    pub async fn check_now(&self) -> HealthSnapshot {
        let mut set = JoinSet::new();
        for (i, probe) in self.probes.iter().enumerate() {
            let probe = Arc::clone(probe);
            let timeout = self.probe_timeout;
            set.spawn(async move { (i, run_probe(probe.as_ref(), timeout).await) });
        }

        let mut reports: Vec<Option<HealthReport>> = vec![None; self.probes.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, report)) => reports[i] = Some(report),
                Err(e) => tracing::error!(error = %e, "Health probe task failed"),
            }
        }

        let components: Vec<HealthReport> = reports
            .into_iter()
            .zip(&self.probes)
            .map(|(report, probe)| {
                report.unwrap_or_else(|| HealthReport {
                    component: probe.name().to_string(),
                    status: ProbeStatus::Fail,
                    latency_ms: 0,
                    checked_at: Utc::now(),
                    mandatory: probe.mandatory(),
                    message: Some("probe did not complete".to_string()),
                })
            })
            .collect();

        for c in &components {
            metrics::record_component_health(&c.component, c.passed(), c.latency_ms);
        }

        let snapshot = HealthSnapshot {
            status: overall_status(&components),
            score: self.score(&components),
            checked_at: Utc::now(),
            components,
        };
        tracing::debug!(status = ?snapshot.status, score = snapshot.score, "Health check round complete");

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Cached {
            snapshot: snapshot.clone(),
            at: Instant::now(),
        });
        snapshot
    }

    fn score(&self, components: &[HealthReport]) -> f64 {
        let total: f64 = components.iter().map(|c| self.weight(&c.component)).sum();
        if total <= 0.0 {
            return 100.0;
        }
        let passing: f64 = components
            .iter()
            .filter(|c| c.passed())
            .map(|c| self.weight(&c.component))
            .sum();
        (passing / total * 1000.0).round() / 10.0
    }

    /// Last cached snapshot, regardless of age.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.snapshot.clone())
    }

    /// Cached snapshot if fresh, otherwise a new round.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let fresh = {
            let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
            latest
                .as_ref()
                .filter(|c| c.at.elapsed() < self.max_age)
                .map(|c| c.snapshot.clone())
        };
        match fresh {
            Some(snapshot) => snapshot,
            None => self.check_now().await,
        }
    }

    /// The process is responsive. Never runs probes.
    pub fn liveness(&self) -> Liveness {
        Liveness {
            status: ProbeStatus::Pass,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// All mandatory dependencies are currently reachable.
    pub async fn readiness(&self) -> Readiness {
        let snapshot = self.snapshot().await;
        let failing: Vec<String> = snapshot
            .components
            .iter()
            .filter(|c| c.mandatory && !c.passed())
            .map(|c| c.component.clone())
            .collect();
        Readiness {
            ready: failing.is_empty(),
            status: snapshot.status,
            failing,
        }
    }

    /// Counters plus gauges from the latest snapshot. Never runs probes.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let latest = self.latest();
        MetricsSnapshot {
            total_sync_operations: self.counters.total_operations(),
            total_sync_errors: self.counters.total_errors(),
            total_sync_runs: self.counters.total_runs(),
            health_score: latest.as_ref().map(|s| s.score),
            components: latest
                .map(|s| {
                    s.components
                        .into_iter()
                        .map(|c| ComponentMetric {
                            healthy: c.passed(),
                            component: c.component,
                            latency_ms: c.latency_ms,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            circuits: self
                .client
                .as_ref()
                .map(|c| c.breaker().snapshot())
                .unwrap_or_default(),
        }
    }

    /// Probe every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            probes = self.probes.len(),
            "Health monitor starting"
        );
        // tokio rejects a zero period
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.check_now().await;
                    if snapshot.status != OverallStatus::Healthy {
                        let failing: Vec<&str> = snapshot
                            .components
                            .iter()
                            .filter(|c| !c.passed())
                            .map(|c| c.component.as_str())
                            .collect();
                        tracing::warn!(status = ?snapshot.status, failing = ?failing, "Health degraded");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

async fn run_probe(probe: &dyn HealthProbe, timeout: Duration) -> HealthReport {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, probe.check()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let (status, message) = match outcome {
        Ok(detail) => (ProbeStatus::Pass, detail),
        Err(reason) => {
            tracing::warn!(component = %probe.name(), reason = %reason, "Health probe failed");
            (ProbeStatus::Fail, Some(reason))
        }
    };

    HealthReport {
        component: probe.name().to_string(),
        status,
        latency_ms,
        checked_at: Utc::now(),
        mandatory: probe.mandatory(),
        message,
    }
}

pub fn overall_status(components: &[HealthReport]) -> OverallStatus {
    if components.iter().any(|c| c.mandatory && !c.passed()) {
        OverallStatus::Unhealthy
    } else if components.iter().any(|c| !c.passed()) {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Prometheus text exposition of a metrics snapshot.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# TYPE sync_operations_total counter");
    let _ = writeln!(out, "sync_operations_total {}", snapshot.total_sync_operations);
    let _ = writeln!(out, "# TYPE sync_errors_total counter");
    let _ = writeln!(out, "sync_errors_total {}", snapshot.total_sync_errors);
    let _ = writeln!(out, "# TYPE sync_runs_total counter");
    let _ = writeln!(out, "sync_runs_total {}", snapshot.total_sync_runs);

    if let Some(score) = snapshot.health_score {
        let _ = writeln!(out, "# TYPE sync_health_score gauge");
        let _ = writeln!(out, "sync_health_score {}", score);
    }

    if !snapshot.components.is_empty() {
        let _ = writeln!(out, "# TYPE sync_component_health gauge");
        for c in &snapshot.components {
            let _ = writeln!(
                out,
                "sync_component_health{{component=\"{}\"}} {}",
                escape_label(&c.component),
                u8::from(c.healthy)
            );
        }
        let _ = writeln!(out, "# TYPE sync_component_latency_ms gauge");
        for c in &snapshot.components {
            let _ = writeln!(
                out,
                "sync_component_latency_ms{{component=\"{}\"}} {}",
                escape_label(&c.component),
                c.latency_ms
            );
        }
    }

    if !snapshot.circuits.is_empty() {
        let _ = writeln!(out, "# TYPE sync_circuit_open gauge");
        for c in &snapshot.circuits {
            let _ = writeln!(
                out,
                "sync_circuit_open{{operation=\"{}\"}} {}",
                escape_label(&c.operation),
                u8::from(c.state != BreakerState::Closed)
            );
        }
    }
    out
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("probes", &self.probes.iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .field("probe_timeout", &self.probe_timeout)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}
