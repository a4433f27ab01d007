//! resilient-sync
//!
//! Pushes records from an upstream source into a rate-limited REST store
//! in dependency order, with idempotent upserts and an audit trail.
//!
//! # Architecture Overview
//!
//! ```text
//!   source ──▶ sync::orchestrator ──▶ client::audited ──▶ store::http ──▶ REST API
//!                 │  topological order    │ rate limit
//!                 │  relation lookup      │ circuit breaker
//!                 │  run state on disk    │ retry + deadline
//!                 ▼                       ▼
//!             SyncReport              audit log
//!
//!   health::aggregator (disk, memory, store ping) ──▶ health::server (/health, /metrics)
//! ```
//!
//! # Exit Codes
//! - 0: run completed, no job failed outright
//! - 1: a job failed or the run aborted (circuit open, auth, source error)
//! - 2: configuration or startup error
//! - 130: interrupted by a signal

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;

use resilient_sync::config::{load_config, SyncConfig};
use resilient_sync::error::SyncError;
use resilient_sync::health::{self, OverallStatus};
use resilient_sync::lifecycle::{self, Components, Shutdown, EXIT_INTERRUPTED};
use resilient_sync::observability::{logging, metrics};
use resilient_sync::sync::{SyncOptions, SyncReport};

#[derive(Parser)]
#[command(name = "resilient-sync")]
#[command(about = "Dependency-ordered, rate-limited record synchronization", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "resilient-sync.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured job once
    Sync {
        /// Validate and preview without issuing mutating calls
        #[arg(long)]
        dry_run: bool,

        /// Ignore checkpoints and push every record
        #[arg(long)]
        full_resync: bool,

        /// Re-run only the records that failed in the last run
        #[arg(long, conflicts_with = "full_resync")]
        retry_failed: bool,

        /// Pause after each record, overriding `batch.delay_ms`
        #[arg(long)]
        batch_delay_ms: Option<u64>,

        /// Serve the health endpoints while the run is in progress
        #[arg(long)]
        serve_health: bool,
    },
    /// Run the health probes once and print the snapshot
    Health,
    /// Serve the health endpoints until interrupted
    Serve,
    /// Validate the configuration and print the job order
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", cli.config.display(), e);
            return ExitCode::from(2);
        }
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "resilient-sync starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let components = match lifecycle::build(&config, &shutdown) {
        Ok(components) => components,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::from(2);
        }
    };
    lifecycle::spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Sync {
            dry_run,
            full_resync,
            retry_failed,
            batch_delay_ms,
            serve_health,
        } => {
            let options = SyncOptions {
                dry_run,
                full_resync,
                batch_delay: Duration::from_millis(batch_delay_ms.unwrap_or(config.batch.delay_ms)),
            };
            let background = if serve_health {
                spawn_health(&components, &shutdown)
            } else {
                Vec::new()
            };

            let code = run_sync(&components, &options, retry_failed).await;

            shutdown.trigger();
            for handle in background {
                let _ = handle.await;
            }
            code
        }
        Commands::Health => {
            let snapshot = components.aggregator.check_now().await;
            if !print_json(&snapshot) {
                return ExitCode::from(2);
            }
            match snapshot.status {
                OverallStatus::Unhealthy => ExitCode::from(1),
                OverallStatus::Healthy | OverallStatus::Degraded => ExitCode::SUCCESS,
            }
        }
        Commands::Serve => {
            for handle in spawn_health(&components, &shutdown) {
                let _ = handle.await;
            }
            ExitCode::SUCCESS
        }
        Commands::Check => check(&config, &components),
    }
}

fn spawn_health(components: &Components, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
    let monitor = tokio::spawn(
        Arc::clone(&components.aggregator).run(components.health_interval, shutdown.subscribe()),
    );

    let aggregator = Arc::clone(&components.aggregator);
    let addr = components.health_address;
    let cancel = shutdown.subscribe();
    let server = tokio::spawn(async move {
        if let Err(e) = health::server::serve(aggregator, addr, cancel).await {
            tracing::error!(address = %addr, error = %e, "Health server failed");
        }
    });

    vec![monitor, server]
}

async fn run_sync(components: &Components, options: &SyncOptions, retry_failed: bool) -> ExitCode {
    let orchestrator = &components.orchestrator;
    let result = if retry_failed {
        orchestrator.run_retry_failed_from_state(options).await
    } else {
        orchestrator.run(options).await
    };

    match result {
        Ok(report) => {
            print_json(&report);
            summarize(&report);
            if report.cancelled {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if report.is_failure() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(SyncError::RunAborted { report, source }) => {
            print_json(&report);
            tracing::error!(
                correlation_id = %report.correlation_id,
                error_kind = %source.kind(),
                error = %source,
                "Sync run aborted"
            );
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error_kind = %e.kind(), error = %e, "Sync run failed");
            ExitCode::from(2)
        }
    }
}

fn summarize(report: &SyncReport) {
    for job in &report.jobs {
        tracing::info!(
            entity_type = %job.entity_type,
            total = job.total,
            created = job.created,
            updated = job.updated,
            would_upsert = job.would_upsert,
            failed = job.failed,
            "Job summary"
        );
    }
    tracing::info!(
        correlation_id = %report.correlation_id,
        succeeded = report.total_succeeded(),
        failed = report.total_failed(),
        retryable = report.retryable_records(),
        cancelled = report.cancelled,
        "Sync run finished"
    );
}

fn check(config: &SyncConfig, components: &Components) -> ExitCode {
    println!("store: {}", config.store.base_url);
    println!(
        "rate limit: {}/s ({:?})",
        config.rate_limit.requests_per_second, config.rate_limit.scope
    );
    for (i, job) in components.orchestrator.jobs().iter().enumerate() {
        if job.depends_on.is_empty() {
            println!("{}. {}", i + 1, job.entity_type);
        } else {
            println!("{}. {} (after {})", i + 1, job.entity_type, job.depends_on.join(", "));
        }
    }
    ExitCode::SUCCESS
}

fn print_json<T: serde::Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize output");
            false
        }
    }
}
