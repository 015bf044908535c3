//! Local store collaborator interfaces.
//!
//! The embedded document store is out of scope for the engine; it is
//! consumed through the narrow traits below. [`memory::MemoryStore`] is the
//! bundled reference implementation, [`kv::KvStore`] a sled-backed
//! [`LocalValueStore`] for metadata that must survive restarts.

pub mod kv;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::query::state::StructuredFilter;

/// One local document. `local_id` is the device-side primary key; the
/// remote ID space is reconciled separately and may be absent for optimistic
/// records that have not been pushed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub local_id: String,
    pub remote_id: Option<u64>,
    pub date_modified: Option<DateTime<Utc>>,
    pub data: Value,
}

impl Document {
    /// Wraps a remote record, lifting the remote `id` and
    /// `date_modified_gmt` into typed fields. The local ID for a remote
    /// record is derived from the remote ID so repeated pulls upsert in
    /// place.
    pub fn from_remote(data: Value) -> Self {
        let remote_id = data.get("id").and_then(Value::as_u64);
        let date_modified = data
            .get("date_modified_gmt")
            .or_else(|| data.get("date_modified"))
            .and_then(Value::as_str)
            .and_then(parse_remote_date);
        let local_id = match remote_id {
            Some(id) => format!("r{}", id),
            None => uuid::Uuid::new_v4().to_string(),
        };
        Self {
            local_id,
            remote_id,
            date_modified,
            data,
        }
    }

    /// A device-local optimistic record with no remote counterpart yet.
    pub fn new_local(data: Value) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            date_modified: Some(Utc::now()),
            data,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Remote timestamps arrive as RFC3339 or as the bare
/// `YYYY-MM-DDTHH:MM:SS` GMT form without an offset.
pub fn parse_remote_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Change notification emitted by a store collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub collection: String,
    pub kind: StoreEventKind,
    pub local_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Inserted,
    Updated,
    Removed,
}

/// Collection-scoped document CRUD with reactive change notifications and a
/// ranked text-search index.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, collection: &str, local_id: &str) -> Result<Option<Document>>;

    async fn find_by_remote_id(&self, collection: &str, remote_id: u64)
        -> Result<Option<Document>>;

    /// Snapshot of documents matching the structured filter.
    async fn find(&self, collection: &str, selector: &StructuredFilter) -> Result<Vec<Document>>;

    /// Full collection snapshot.
    async fn all(&self, collection: &str) -> Result<Vec<Document>>;

    async fn insert(&self, collection: &str, doc: Document) -> Result<()>;

    async fn upsert(&self, collection: &str, doc: Document) -> Result<()>;

    /// Incremental merge of `diff` into the document's data. Only the keys
    /// present in `diff` change; returns the patched document.
    async fn patch(&self, collection: &str, local_id: &str, diff: &Value) -> Result<Document>;

    async fn remove(&self, collection: &str, local_id: &str) -> Result<()>;

    /// Ranked local-ID hits from the text-search index.
    async fn search(&self, collection: &str, text: &str) -> Result<Vec<String>>;

    /// Reactive change stream for one collection.
    fn subscribe(&self, collection: &str) -> broadcast::Receiver<StoreEvent>;
}

/// Auxiliary per-collection key-value metadata (checkpoints, audit
/// snapshots). Read/modify/write is not atomic across processes; the
/// coordinator registry guarantees a single writer per key.
#[async_trait]
pub trait LocalValueStore: Send + Sync {
    async fn get_local(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    async fn set_local(&self, collection: &str, key: &str, value: &Value) -> Result<()>;

    async fn remove_local(&self, collection: &str, key: &str) -> Result<()>;
}
