//! Run results and persisted run state.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::{ErrorKind, SyncError};
use crate::store::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Created,
    Updated,
    WouldUpsert,
    Failed,
}

/// Final status of one record in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub key: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// A record that failed, kept verbatim so it can be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub record: Record,
    pub key: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(record: Record, key: Option<String>, error: &SyncError) -> Self {
        Self {
            record,
            key,
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub entity_type: String,
    pub dry_run: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub created: usize,
    pub updated: usize,
    pub would_upsert: usize,
    /// False when the job stopped early (cancelled or aborted).
    pub completed: bool,
    pub outcomes: Vec<RecordOutcome>,
    pub per_record_errors: Vec<RecordError>,
}

impl BatchResult {
    pub fn new(entity_type: impl Into<String>, dry_run: bool, total: usize) -> Self {
        Self {
            entity_type: entity_type.into(),
            dry_run,
            total,
            succeeded: 0,
            failed: 0,
            created: 0,
            updated: 0,
            would_upsert: 0,
            completed: false,
            outcomes: Vec::with_capacity(total),
            per_record_errors: Vec::new(),
        }
    }

    pub fn record_success(&mut self, key: String, status: RecordStatus, remote_id: Option<String>) {
        match status {
            RecordStatus::Created => self.created += 1,
            RecordStatus::Updated => self.updated += 1,
            RecordStatus::WouldUpsert => self.would_upsert += 1,
            RecordStatus::Failed => {}
        }
        self.succeeded += 1;
        self.outcomes.push(RecordOutcome { key, status, remote_id });
    }

    pub fn record_failure(&mut self, error: RecordError) {
        self.failed += 1;
        self.outcomes.push(RecordOutcome {
            key: error.key.clone().unwrap_or_default(),
            status: RecordStatus::Failed,
            remote_id: None,
        });
        self.per_record_errors.push(error);
    }

    /// Records neither succeeded nor failed because the job stopped early.
    pub fn unprocessed(&self) -> usize {
        self.total.saturating_sub(self.succeeded + self.failed)
    }

    /// A job fails outright only when it had records and none succeeded.
    pub fn is_job_failure(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub correlation_id: CorrelationId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub jobs: Vec<BatchResult>,
    pub cancelled: bool,
    /// Why the run stopped early, if it did.
    pub aborted: Option<String>,
}

impl SyncReport {
    pub fn new(correlation_id: CorrelationId, dry_run: bool) -> Self {
        Self {
            correlation_id,
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            jobs: Vec::new(),
            cancelled: false,
            aborted: None,
        }
    }

    pub fn job(&self, entity_type: &str) -> Option<&BatchResult> {
        self.jobs.iter().find(|j| j.entity_type == entity_type)
    }

    pub fn total_succeeded(&self) -> usize {
        self.jobs.iter().map(|j| j.succeeded).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.jobs.iter().map(|j| j.failed).sum()
    }

    /// Whether the process should exit non-zero.
    pub fn is_failure(&self) -> bool {
        self.aborted.is_some() || self.jobs.iter().any(BatchResult::is_job_failure)
    }

    /// Number of records across all jobs that would be retried.
    pub fn retryable_records(&self) -> usize {
        self.jobs.iter().map(|j| j.per_record_errors.len()).sum()
    }
}

/// State carried between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub last_report: Option<SyncReport>,
    /// Start time of the last run in which each entity type fully succeeded.
    #[serde(default)]
    pub checkpoints: HashMap<String, DateTime<Utc>>,
}

impl RunState {
    /// Load from `path`, or start empty when the file does not exist yet.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let reader = BufReader::new(File::open(path)?);
        let state: Self = serde_json::from_reader(reader)?;
        tracing::info!(
            path = %path.display(),
            checkpoints = state.checkpoints.len(),
            "Loaded run state"
        );
        Ok(state)
    }

    /// Write to `path` through a temporary file.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(writer, self)?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), "Saved run state");
        Ok(())
    }

    pub fn checkpoint(&self, entity_type: &str) -> Option<DateTime<Utc>> {
        self.checkpoints.get(entity_type).copied()
    }

    /// Fold a finished run in. Dry runs leave checkpoints untouched.
    pub fn apply(&mut self, report: &SyncReport) {
        self.apply_at(report, report.started_at);
    }

    /// Like `apply`, but fully synced entity types are checkpointed at
    /// `checkpoint` (a retry run covers the window of the run it retries).
    pub fn apply_at(&mut self, report: &SyncReport, checkpoint: DateTime<Utc>) {
        if !report.dry_run {
            for job in &report.jobs {
                if job.completed && job.failed == 0 {
                    self.checkpoints.insert(job.entity_type.clone(), checkpoint);
                }
            }
        }
        self.last_report = Some(report.clone());
    }
}
