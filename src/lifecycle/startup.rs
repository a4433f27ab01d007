//! Startup wiring.
//!
//! Builds every component from a validated [`SyncConfig`] in dependency
//! order: store, client, source, orchestrator, health aggregator. Any
//! failure here is fatal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::client::AuditedApiClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::health::HealthAggregator;
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::metrics::SyncCounters;
use crate::store::{HttpRecordStore, RecordStore};
use crate::sync::{source_from_config, SyncJobDescriptor, SyncOrchestrator};

/// Everything a command needs, built from one config.
#[derive(Debug)]
pub struct Components {
    pub client: Arc<AuditedApiClient>,
    pub orchestrator: SyncOrchestrator,
    pub aggregator: Arc<HealthAggregator>,
    pub counters: Arc<SyncCounters>,
    pub health_address: SocketAddr,
    pub health_interval: Duration,
}

/// Read the store token from the configured environment variable.
pub fn store_token(config: &SyncConfig) -> SyncResult<String> {
    match std::env::var(&config.store.token_env) {
        Ok(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(SyncError::Authentication {
            operation: "startup".to_string(),
            status: 0,
            message: format!("environment variable {} is not set", config.store.token_env),
        }),
    }
}

/// Build components against the configured HTTP store.
pub fn build(config: &SyncConfig, shutdown: &Shutdown) -> SyncResult<Components> {
    let token = store_token(config)?;
    let store = HttpRecordStore::new(
        &config.store,
        &token,
        Duration::from_secs(config.timeouts.request_secs),
    )?;
    build_with_store(config, Arc::new(store), shutdown)
}

/// Build components against any store.
pub fn build_with_store(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    shutdown: &Shutdown,
) -> SyncResult<Components> {
    let health_address: SocketAddr = config.health.bind_address.parse().map_err(|_| {
        SyncError::validation("health.bind_address", format!("'{}' is not a socket address", config.health.bind_address))
    })?;

    let counters = Arc::new(SyncCounters::new());
    let client = Arc::new(AuditedApiClient::from_config(store, config));
    let source = source_from_config(&config.source);
    let jobs: Vec<SyncJobDescriptor> = config.jobs.iter().map(SyncJobDescriptor::from).collect();

    let mut orchestrator = SyncOrchestrator::new(client.clone(), source, jobs)?
        .with_counters(counters.clone())
        .with_cancellation(shutdown.subscribe());
    if let Some(path) = &config.state_file {
        orchestrator = orchestrator.with_state_file(path);
    }

    let aggregator = Arc::new(HealthAggregator::from_config(
        &config.health,
        client.clone(),
        counters.clone(),
    ));

    tracing::info!(
        jobs = orchestrator.jobs().len(),
        store = %config.store.base_url,
        rate_limit = config.rate_limit.requests_per_second,
        "Components initialized"
    );

    Ok(Components {
        client,
        orchestrator,
        aggregator,
        counters,
        health_address,
        health_interval: Duration::from_secs(config.health.interval_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::store::MemoryRecordStore;

    const CONFIG: &str = r#"
[source]
kind = "empty"

[[jobs]]
entity_type = "devices"
depends_on = ["customers"]
upsert_key = "serial"

[[jobs]]
entity_type = "customers"
upsert_key = "customer_id"
"#;

    #[test]
    fn test_build_orders_jobs() {
        let config = parse_config(CONFIG).unwrap();
        let components =
            build_with_store(&config, Arc::new(MemoryRecordStore::new()), &Shutdown::new()).unwrap();
        let order: Vec<&str> = components
            .orchestrator
            .jobs()
            .iter()
            .map(|j| j.entity_type.as_str())
            .collect();
        assert_eq!(order, vec!["customers", "devices"]);
    }

    #[test]
    fn test_shutdown_reaches_orchestrator() {
        let config = parse_config(CONFIG).unwrap();
        let shutdown = Shutdown::new();
        let components = build_with_store(&config, Arc::new(MemoryRecordStore::new()), &shutdown).unwrap();
        shutdown.trigger();
        assert!(components.orchestrator.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_missing_token_is_auth_error() {
        let mut config = parse_config(CONFIG).unwrap();
        config.store.token_env = "RESILIENT_SYNC_TEST_UNSET_TOKEN".to_string();
        let err = build(&config, &Shutdown::new()).unwrap_err();
        assert!(matches!(err, SyncError::Authentication { .. }));
    }
}
