//! In-memory reference store.
//!
//! Backs the unit tests and serves as the embeddable default when no real
//! document store is wired in. Search is a naive ranked substring scan over
//! string fields, name/title hits first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Result, TillSyncError};
use crate::query::state::StructuredFilter;

use super::{Document, LocalStore, LocalValueStore, StoreEvent, StoreEventKind};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Collection {
    docs: BTreeMap<String, Document>,
    local_values: HashMap<String, Value>,
}

pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    channels: RwLock<HashMap<String, broadcast::Sender<StoreEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        })
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<StoreEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn emit(&self, collection: &str, kind: StoreEventKind, local_id: &str) {
        // Send fails when nobody subscribes; that is fine.
        let _ = self.sender(collection).send(StoreEvent {
            collection: collection.to_string(),
            kind,
            local_id: local_id.to_string(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, collection: &str, local_id: &str) -> Result<Option<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|c| c.docs.get(local_id))
            .cloned())
    }

    async fn find_by_remote_id(
        &self,
        collection: &str,
        remote_id: u64,
    ) -> Result<Option<Document>> {
        let collections = self.collections.read();
        Ok(collections.get(collection).and_then(|c| {
            c.docs
                .values()
                .find(|d| d.remote_id == Some(remote_id))
                .cloned()
        }))
    }

    async fn find(&self, collection: &str, selector: &StructuredFilter) -> Result<Vec<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|d| selector.matches(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn all(&self, collection: &str) -> Result<Vec<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<()> {
        let local_id = doc.local_id.clone();
        {
            let mut collections = self.collections.write();
            let coll = collections.entry(collection.to_string()).or_default();
            if coll.docs.contains_key(&local_id) {
                return Err(TillSyncError::InvalidInput(format!(
                    "duplicate local_id {} in {}",
                    local_id, collection
                )));
            }
            coll.docs.insert(local_id.clone(), doc);
        }
        self.emit(collection, StoreEventKind::Inserted, &local_id);
        Ok(())
    }

    async fn upsert(&self, collection: &str, doc: Document) -> Result<()> {
        let local_id = doc.local_id.clone();
        let existed = {
            let mut collections = self.collections.write();
            let coll = collections.entry(collection.to_string()).or_default();
            coll.docs.insert(local_id.clone(), doc).is_some()
        };
        let kind = if existed {
            StoreEventKind::Updated
        } else {
            StoreEventKind::Inserted
        };
        self.emit(collection, kind, &local_id);
        Ok(())
    }

    async fn patch(&self, collection: &str, local_id: &str, diff: &Value) -> Result<Document> {
        let patched = {
            let mut collections = self.collections.write();
            let coll = collections
                .get_mut(collection)
                .ok_or_else(|| TillSyncError::Apply(format!("no collection {}", collection)))?;
            let doc = coll.docs.get_mut(local_id).ok_or_else(|| {
                TillSyncError::Apply(format!("no document {} in {}", local_id, collection))
            })?;
            merge_into(&mut doc.data, diff);
            if let Some(id) = doc.data.get("id").and_then(Value::as_u64) {
                doc.remote_id = Some(id);
            }
            doc.clone()
        };
        self.emit(collection, StoreEventKind::Updated, local_id);
        Ok(patched)
    }

    async fn remove(&self, collection: &str, local_id: &str) -> Result<()> {
        let removed = {
            let mut collections = self.collections.write();
            collections
                .get_mut(collection)
                .map(|c| c.docs.remove(local_id).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.emit(collection, StoreEventKind::Removed, local_id);
        }
        Ok(())
    }

    async fn search(&self, collection: &str, text: &str) -> Result<Vec<String>> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let collections = self.collections.read();
        let mut hits: Vec<(u8, String)> = collections
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter_map(|d| search_rank(d, &needle).map(|r| (r, d.local_id.clone())))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort();
        Ok(hits.into_iter().map(|(_, id)| id).collect())
    }

    fn subscribe(&self, collection: &str) -> broadcast::Receiver<StoreEvent> {
        self.sender(collection).subscribe()
    }
}

#[async_trait]
impl LocalValueStore for MemoryStore {
    async fn get_local(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|c| c.local_values.get(key))
            .cloned())
    }

    async fn set_local(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        coll.local_values.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove_local(&self, collection: &str, key: &str) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(coll) = collections.get_mut(collection) {
            coll.local_values.remove(key);
        }
        Ok(())
    }
}

/// Shallow merge: keys present in `diff` replace the target's keys.
fn merge_into(target: &mut Value, diff: &Value) {
    match (target, diff) {
        (Value::Object(t), Value::Object(d)) => {
            for (k, v) in d {
                t.insert(k.clone(), v.clone());
            }
        }
        (target, diff) => *target = diff.clone(),
    }
}

/// Rank 0: name/title prefix hit; 1: name/title substring; 2: any other
/// string field substring. None: no hit.
fn search_rank(doc: &Document, needle: &str) -> Option<u8> {
    let name = doc
        .field("name")
        .or_else(|| doc.field("title"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    if let Some(name) = name {
        if name.starts_with(needle) {
            return Some(0);
        }
        if name.contains(needle) {
            return Some(1);
        }
    }
    let other_hit = doc
        .data
        .as_object()
        .map(|fields| {
            fields.iter().any(|(k, v)| {
                k != "name"
                    && k != "title"
                    && v.as_str()
                        .map(|s| s.to_lowercase().contains(needle))
                        .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    if other_hit {
        Some(2)
    } else {
        None
    }
}
