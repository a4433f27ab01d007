//! In-process record store.
//!
//! Used for local dry runs and as the test double behind `AuditedApiClient`.
//! Faults can be scripted per operation to simulate 5xx storms, throttling,
//! hangs and "committed but response lost" partial failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult, TransientCause};
use crate::store::{QueryPage, Record, RecordStore, RemoteRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Query,
    Create,
    Update,
    Ping,
}

impl StoreOp {
    fn index(self) -> usize {
        match self {
            Self::Query => 0,
            Self::Create => 1,
            Self::Update => 2,
            Self::Ping => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Create => "create",
            Self::Update => "update",
            Self::Ping => "ping",
        }
    }
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Answer with this HTTP status.
    Status(u16),
    /// Answer 429 with a Retry-After hint.
    Throttled(Duration),
    /// Connection reset.
    Network,
    /// Sleep before answering normally.
    Delay(Duration),
    /// Apply the write, then report a timeout.
    CommitThenTimeout,
}

#[derive(Debug, Default)]
struct Faults {
    once: HashMap<StoreOp, VecDeque<Fault>>,
    always: HashMap<StoreOp, Fault>,
}

impl Faults {
    fn next(&mut self, op: StoreOp) -> Option<Fault> {
        if let Some(fault) = self.once.get_mut(&op).and_then(|q| q.pop_front()) {
            return Some(fault);
        }
        self.always.get(&op).cloned()
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: Mutex<HashMap<String, Vec<RemoteRecord>>>,
    faults: Mutex<Faults>,
    calls: [AtomicU32; 4],
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_matches(fields: &Record, key_field: &str, key: &str) -> bool {
    match fields.get(key_field) {
        Some(Value::String(s)) => s == key,
        Some(Value::Number(n)) => n.to_string() == key,
        _ => false,
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `fault`.
    pub fn inject(&self, op: StoreOp, fault: Fault, times: usize) {
        let mut faults = lock(&self.faults);
        let queue = faults.once.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(fault.clone());
        }
    }

    /// Fail every call of `op` until cleared.
    pub fn inject_always(&self, op: StoreOp, fault: Fault) {
        lock(&self.faults).always.insert(op, fault);
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    /// Insert a record directly, bypassing counters and faults.
    pub fn seed(&self, collection: &str, fields: Record) -> RemoteRecord {
        let record = RemoteRecord {
            id: self.allocate_id(),
            fields,
        };
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    pub fn records(&self, collection: &str) -> Vec<RemoteRecord> {
        lock(&self.collections).get(collection).cloned().unwrap_or_default()
    }

    pub fn calls(&self, op: StoreOp) -> u32 {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Creates plus updates.
    pub fn mutating_calls(&self) -> u32 {
        self.calls(StoreOp::Create) + self.calls(StoreOp::Update)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    fn allocate_id(&self) -> String {
        format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Count the call and apply any scripted fault. Returns whether the
    /// operation should report a lost response after committing.
    async fn enter(&self, op: StoreOp, target: &str) -> SyncResult<bool> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        let operation = format!("{}.{}", target, op.name());
        let fault = lock(&self.faults).next(op);

        match fault {
            None => Ok(false),
            Some(Fault::Status(status)) => {
                Err(SyncError::from_status(operation, status, "injected fault", None))
            }
            Some(Fault::Throttled(hint)) => {
                Err(SyncError::from_status(operation, 429, "injected throttle", Some(hint)))
            }
            Some(Fault::Network) => Err(SyncError::transient(
                operation,
                TransientCause::Network,
                "injected connection reset",
            )),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(false)
            }
            Some(Fault::CommitThenTimeout) => Ok(true),
        }
    }

    fn lost_response(target: &str, op: StoreOp) -> SyncError {
        SyncError::transient(
            format!("{}.{}", target, op.name()),
            TransientCause::Timeout,
            "response lost after commit",
        )
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn query_page(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        _cursor: Option<&str>,
    ) -> SyncResult<QueryPage> {
        self.enter(StoreOp::Query, collection).await?;
        let collections = lock(&self.collections);
        let found = collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| key_matches(&r.fields, key_field, key)))
            .cloned();
        Ok(QueryPage {
            found,
            next_cursor: None,
        })
    }

    async fn create(&self, collection: &str, fields: &Record) -> SyncResult<RemoteRecord> {
        let lose_response = self.enter(StoreOp::Create, collection).await?;
        let record = RemoteRecord {
            id: self.allocate_id(),
            fields: fields.clone(),
        };
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());

        if lose_response {
            return Err(Self::lost_response(collection, StoreOp::Create));
        }
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, fields: &Record) -> SyncResult<RemoteRecord> {
        let lose_response = self.enter(StoreOp::Update, collection).await?;
        let updated = {
            let mut collections = lock(&self.collections);
            let record = collections
                .get_mut(collection)
                .and_then(|records| records.iter_mut().find(|r| r.id == id))
                .ok_or_else(|| SyncError::Api {
                    operation: format!("{}.update", collection),
                    status: 404,
                    message: format!("record {} not found", id),
                })?;
            for (k, v) in fields {
                record.fields.insert(k.clone(), v.clone());
            }
            record.clone()
        };

        if lose_response {
            return Err(Self::lost_response(collection, StoreOp::Update));
        }
        Ok(updated)
    }

    async fn ping(&self) -> SyncResult<()> {
        self.enter(StoreOp::Ping, "store").await.map(|_| ())
    }
}
