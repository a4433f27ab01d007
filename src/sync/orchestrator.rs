//! Dependency-ordered sync runs.
//!
//! # Run Flow
//! ```text
//! new(jobs)            topological order, cycles rejected here
//! run(options)
//!     for job in order (cancellation checked before each job):
//!         fetch or fetch_changed(checkpoint)
//!         for record (cancellation checked before each record):
//!             resolve relation keys → transform → find_or_create | preview
//!             failure → BatchResult.per_record_errors, keep going
//!             open breaker / auth failure → stop the run (RunAborted)
//!     persist RunState (last report + checkpoints)
//! run_retry_failed(previous)
//!     same loop over previous.per_record_errors only
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::validation::prepare_upsert;
use crate::client::{AuditedApiClient, UpsertAction};
use crate::correlation::CorrelationId;
use crate::error::{SyncError, SyncResult};
use crate::observability::metrics::{self, SyncCounters};
use crate::store::Record;
use crate::sync::job::{topological_order, SyncJobDescriptor};
use crate::sync::result::{BatchResult, RecordError, RecordStatus, RunState, SyncReport};
use crate::sync::source::RecordSource;
use crate::sync::transform::{record_key, transform, KeyIndex};

/// Flags for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Preview only: no mutating call is issued.
    pub dry_run: bool,
    /// Ignore checkpoints and fetch every record.
    pub full_resync: bool,
    /// Pause after each upserted record.
    pub batch_delay: Duration,
}

enum Input<'a> {
    Fetch,
    Retry(&'a SyncReport),
}

/// Runs sync jobs in dependency order through an `AuditedApiClient`.
pub struct SyncOrchestrator {
    client: Arc<AuditedApiClient>,
    source: Arc<dyn RecordSource>,
    jobs: Vec<SyncJobDescriptor>,
    counters: Arc<SyncCounters>,
    cancel: CancellationToken,
    state_file: Option<PathBuf>,
}

impl SyncOrchestrator {
    /// Fails with `OrchestrationConfig` on cycles or unknown dependencies.
    pub fn new(
        client: Arc<AuditedApiClient>,
        source: Arc<dyn RecordSource>,
        jobs: Vec<SyncJobDescriptor>,
    ) -> SyncResult<Self> {
        let jobs = topological_order(&jobs)?;
        tracing::debug!(
            order = ?jobs.iter().map(|j| j.entity_type.as_str()).collect::<Vec<_>>(),
            "Sync job order resolved"
        );
        Ok(Self {
            client,
            source,
            jobs,
            counters: Arc::new(SyncCounters::new()),
            cancel: CancellationToken::new(),
            state_file: None,
        })
    }

    pub fn with_counters(mut self, counters: Arc<SyncCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Jobs in execution order.
    pub fn jobs(&self) -> &[SyncJobDescriptor] {
        &self.jobs
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> Arc<SyncCounters> {
        self.counters.clone()
    }

    /// Run every job.
    pub async fn run(&self, options: &SyncOptions) -> SyncResult<SyncReport> {
        self.execute(options, Input::Fetch).await
    }

    /// Re-run only the records that failed in `previous`.
    pub async fn run_retry_failed(&self, previous: &SyncReport, options: &SyncOptions) -> SyncResult<SyncReport> {
        self.execute(options, Input::Retry(previous)).await
    }

    /// Re-run the failures of the last persisted report.
    pub async fn run_retry_failed_from_state(&self, options: &SyncOptions) -> SyncResult<SyncReport> {
        let previous = self.load_state().last_report;
        match previous {
            Some(previous) => self.run_retry_failed(&previous, options).await,
            None => {
                tracing::warn!("No previous run recorded, nothing to retry");
                let mut report = SyncReport::new(CorrelationId::new(), options.dry_run);
                report.finished_at = Some(Utc::now());
                Ok(report)
            }
        }
    }

    fn load_state(&self) -> RunState {
        let Some(path) = &self.state_file else {
            return RunState::default();
        };
        RunState::load(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable run state, starting fresh");
            RunState::default()
        })
    }

    fn persist(&self, mut state: RunState, report: &SyncReport, checkpoint: DateTime<Utc>) {
        let Some(path) = &self.state_file else {
            return;
        };
        if report.dry_run {
            return;
        }
        state.apply_at(report, checkpoint);
        if let Err(e) = state.save(path) {
            tracing::error!(path = %path.display(), error = %e, "Failed to save run state");
        }
    }

    async fn execute(&self, options: &SyncOptions, input: Input<'_>) -> SyncResult<SyncReport> {
        let correlation_id = CorrelationId::new();
        let span = tracing::info_span!(
            "sync_run",
            correlation_id = %correlation_id,
            dry_run = options.dry_run,
            retry_failed = matches!(input, Input::Retry(_))
        );
        self.execute_inner(options, input, correlation_id).instrument(span).await
    }

    async fn execute_inner(
        &self,
        options: &SyncOptions,
        input: Input<'_>,
        correlation_id: CorrelationId,
    ) -> SyncResult<SyncReport> {
        let state = self.load_state();
        let mut report = SyncReport::new(correlation_id.clone(), options.dry_run);
        let checkpoint = match input {
            Input::Fetch => report.started_at,
            Input::Retry(previous) => previous.started_at,
        };
        let mut index = KeyIndex::new();

        tracing::info!(jobs = self.jobs.len(), "Sync run starting");

        let mut abort: Option<SyncError> = None;
        for job in &self.jobs {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let records = match &input {
                Input::Fetch => {
                    let since = if options.full_resync {
                        None
                    } else {
                        state.checkpoint(&job.entity_type)
                    };
                    let fetched = match since {
                        Some(since) => self.source.fetch_changed(&job.entity_type, since).await,
                        None => self.source.fetch(&job.entity_type).await,
                    };
                    match fetched {
                        Ok(records) => records,
                        Err(e) => {
                            abort = Some(e);
                            break;
                        }
                    }
                }
                Input::Retry(previous) => match previous.job(&job.entity_type) {
                    Some(batch) if !batch.per_record_errors.is_empty() => batch
                        .per_record_errors
                        .iter()
                        .map(|e| e.record.clone())
                        .collect(),
                    _ => continue,
                },
            };

            let (batch, error) = self
                .run_job(job, records, options, &correlation_id, &mut index)
                .await;
            tracing::info!(
                entity_type = %batch.entity_type,
                total = batch.total,
                succeeded = batch.succeeded,
                failed = batch.failed,
                created = batch.created,
                updated = batch.updated,
                would_upsert = batch.would_upsert,
                "Sync job finished"
            );
            report.jobs.push(batch);

            match error {
                Some(SyncError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Some(e) => {
                    abort = Some(e);
                    break;
                }
                None => {}
            }
        }

        report.finished_at = Some(Utc::now());
        if !options.dry_run {
            self.counters.record_run();
        }

        if let Some(e) = abort {
            report.aborted = Some(e.to_string());
            tracing::error!(
                correlation_id = %correlation_id,
                error_kind = %e.kind(),
                error = %e,
                succeeded = report.total_succeeded(),
                failed = report.total_failed(),
                "Sync run aborted"
            );
            self.persist(state, &report, checkpoint);
            return Err(SyncError::RunAborted {
                report: Box::new(report),
                source: Box::new(e),
            });
        }

        if report.cancelled {
            tracing::warn!(
                succeeded = report.total_succeeded(),
                failed = report.total_failed(),
                "Sync run cancelled, partial results kept"
            );
        } else {
            tracing::info!(
                succeeded = report.total_succeeded(),
                failed = report.total_failed(),
                "Sync run complete"
            );
        }
        self.persist(state, &report, checkpoint);
        Ok(report)
    }

    /// Process one job's records. Returns the batch and, when the job had to
    /// stop early, the reason.
    async fn run_job(
        &self,
        job: &SyncJobDescriptor,
        records: Vec<Record>,
        options: &SyncOptions,
        correlation_id: &CorrelationId,
        index: &mut KeyIndex,
    ) -> (BatchResult, Option<SyncError>) {
        let mut batch = BatchResult::new(&job.entity_type, options.dry_run, records.len());

        for (position, record) in records.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return (batch, Some(SyncError::Cancelled));
            }

            let key = record_key(job, &record);
            let record_cid = correlation_id.child(&format!(
                "{}:{}",
                job.entity_type,
                key.clone().unwrap_or_else(|| position.to_string())
            ));

            match self.sync_record(job, &record, options, &record_cid, index).await {
                Ok((key, status, remote_id)) => {
                    metrics::record_record_outcome(&job.entity_type, status_label(status));
                    if !options.dry_run {
                        self.counters.record_operation(true);
                    }
                    batch.record_success(key, status, remote_id);
                }
                Err(e) => {
                    metrics::record_record_outcome(&job.entity_type, "failed");
                    self.counters.record_operation(false);
                    tracing::warn!(
                        correlation_id = %record_cid,
                        entity_type = %job.entity_type,
                        key = key.as_deref().unwrap_or(""),
                        error_kind = %e.kind(),
                        error = %e,
                        "Record failed"
                    );
                    let stop = e.aborts_run();
                    batch.record_failure(RecordError::new(record, key, &e));
                    if stop {
                        return (batch, Some(e));
                    }
                    continue;
                }
            }

            if !options.dry_run && !options.batch_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(options.batch_delay) => {}
                }
            }
        }

        batch.completed = true;
        (batch, None)
    }

    async fn sync_record(
        &self,
        job: &SyncJobDescriptor,
        record: &Record,
        options: &SyncOptions,
        correlation_id: &CorrelationId,
        index: &mut KeyIndex,
    ) -> SyncResult<(String, RecordStatus, Option<String>)> {
        for (entity_type, key) in index.missing(job, record) {
            let Some(parent) = self.jobs.iter().find(|j| j.entity_type == entity_type) else {
                continue;
            };
            let found = self
                .client
                .find(&parent.collection, parent.target_key_field(), &key, correlation_id)
                .await?;
            if let Some(found) = found {
                index.insert(&entity_type, key, found.id);
            }
        }

        let target = transform(job, record, index)?;

        if options.dry_run {
            prepare_upsert(&job.collection, &target.key_field, &target.key, &target.fields)?;
            index.insert(&job.entity_type, target.key.clone(), format!("dry-run:{}", target.key));
            return Ok((target.key, RecordStatus::WouldUpsert, None));
        }

        let outcome = self
            .client
            .find_or_create(&job.collection, &target.key_field, &target.key, &target.fields, correlation_id)
            .await?;
        index.insert(&job.entity_type, target.key.clone(), outcome.id.clone());

        let status = match outcome.action {
            UpsertAction::Created => RecordStatus::Created,
            UpsertAction::Updated => RecordStatus::Updated,
        };
        Ok((target.key, status, Some(outcome.id)))
    }
}

fn status_label(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Created => "created",
        RecordStatus::Updated => "updated",
        RecordStatus::WouldUpsert => "would_upsert",
        RecordStatus::Failed => "failed",
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("jobs", &self.jobs.iter().map(|j| j.entity_type.as_str()).collect::<Vec<_>>())
            .field("state_file", &self.state_file)
            .finish_non_exhaustive()
    }
}
