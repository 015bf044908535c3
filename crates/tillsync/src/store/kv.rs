//! Sled-backed auxiliary metadata store.
//!
//! Holds the per-identity checkpoints and per-endpoint audit snapshots that
//! must survive process restarts. One sled tree per collection keeps the
//! namespaces isolated; values are JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sled::{Db, Tree};
use std::collections::HashMap;

use crate::error::{Result, TillSyncError};

use super::LocalValueStore;

#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Arc<Db>,
    trees: RwLock<HashMap<String, Tree>>,
}

impl KvStore {
    /// Opens (or creates) the metadata database under `base_path/meta`.
    ///
    /// A previous instance for the same path may have just released its
    /// lock, so the open retries with backoff.
    pub async fn open(base_path: &Path) -> Result<Arc<Self>> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("meta");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| TillSyncError::Io(format!("create meta dir: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            TillSyncError::KvStore(
                last_err
                    .map(|e| format!("open sled database: {}", e))
                    .unwrap_or_else(|| "open sled database".to_string()),
            )
        })?;

        Ok(Arc::new(Self {
            base_path,
            db: Arc::new(db),
            trees: RwLock::new(HashMap::new()),
        }))
    }

    fn tree(&self, collection: &str) -> Result<Tree> {
        if let Some(tree) = self.trees.read().get(collection) {
            return Ok(tree.clone());
        }
        let tree = self
            .db
            .open_tree(format!("meta_{}", collection))
            .map_err(|e| TillSyncError::KvStore(format!("open tree {}: {}", collection, e)))?;
        self.trees
            .write()
            .insert(collection.to_string(), tree.clone());
        Ok(tree)
    }

    /// Drops every key of one collection. Used when the owning collection is
    /// cleared/reset, which also destroys its checkpoints and snapshots.
    pub fn clear_collection(&self, collection: &str) -> Result<()> {
        self.trees.write().remove(collection);
        self.db
            .drop_tree(format!("meta_{}", collection))
            .map_err(|e| TillSyncError::KvStore(format!("drop tree {}: {}", collection, e)))?;
        Ok(())
    }
}

#[async_trait]
impl LocalValueStore for KvStore {
    async fn get_local(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let tree = self.tree(collection)?;
        let raw = tree
            .get(key.as_bytes())
            .map_err(|e| TillSyncError::KvStore(format!("get {}: {}", key, e)))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_local(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let tree = self.tree(collection)?;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes)
            .map_err(|e| TillSyncError::KvStore(format!("set {}: {}", key, e)))?;
        Ok(())
    }

    async fn remove_local(&self, collection: &str, key: &str) -> Result<()> {
        let tree = self.tree(collection)?;
        tree.remove(key.as_bytes())
            .map_err(|e| TillSyncError::KvStore(format!("remove {}: {}", key, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = KvStore::open(dir.path()).await.unwrap();
            kv.set_local("products", "sync_checkpoint:abc", &json!({"next_page": 3}))
                .await
                .unwrap();
        }
        let kv = KvStore::open(dir.path()).await.unwrap();
        assert_eq!(
            kv.get_local("products", "sync_checkpoint:abc").await.unwrap(),
            Some(json!({"next_page": 3}))
        );
    }

    #[tokio::test]
    async fn collections_are_isolated_and_clearable() {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::open(dir.path()).await.unwrap();
        kv.set_local("products", "k", &json!(1)).await.unwrap();
        kv.set_local("orders", "k", &json!(2)).await.unwrap();

        assert_eq!(kv.get_local("products", "k").await.unwrap(), Some(json!(1)));
        assert_eq!(kv.get_local("orders", "k").await.unwrap(), Some(json!(2)));

        kv.clear_collection("products").unwrap();
        assert_eq!(kv.get_local("products", "k").await.unwrap(), None);
        assert_eq!(kv.get_local("orders", "k").await.unwrap(), Some(json!(2)));
    }
}
