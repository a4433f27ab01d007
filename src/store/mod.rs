//! Downstream record stores.
//!
//! # Data Flow
//! ```text
//! client/audited.rs (limiter → breaker → retry → timeout)
//!     → RecordStore::query_page / create / update / ping
//!         → http.rs   (Notion-like REST API over reqwest)
//!         → memory.rs (in-process store, failure injection for tests)
//! ```
//!
//! Stores translate transport outcomes into `SyncError`; they never retry
//! or throttle on their own. Keyed queries are exposed one page at a time
//! so the client can take a limiter slot per request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

pub mod http;
pub mod memory;

pub use http::HttpRecordStore;
pub use memory::{Fault, MemoryRecordStore, StoreOp};

/// A flat field map, as yielded by sources and accepted by stores.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A record as it exists in the downstream store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub fields: Record,
}

/// One page of a keyed query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub found: Option<RemoteRecord>,
    /// Set when nothing matched yet and the store has more pages.
    pub next_cursor: Option<String>,
}

/// A store that accepts upserts.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// One request's worth of the search for `key_field == key`.
    async fn query_page(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        cursor: Option<&str>,
    ) -> SyncResult<QueryPage>;

    /// First record in `collection` whose `key_field` equals `key`, following
    /// cursors back to back without pacing.
    async fn query(&self, collection: &str, key_field: &str, key: &str) -> SyncResult<Option<RemoteRecord>> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self.query_page(collection, key_field, key, cursor.as_deref()).await?;
            if page.found.is_some() {
                return Ok(page.found);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn create(&self, collection: &str, fields: &Record) -> SyncResult<RemoteRecord>;

    async fn update(&self, collection: &str, id: &str, fields: &Record) -> SyncResult<RemoteRecord>;

    /// Cheap reachability check.
    async fn ping(&self) -> SyncResult<()>;
}
