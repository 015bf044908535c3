//! Persisted pull cursor per replication identity.
//!
//! Key format: `sync_checkpoint:{identity}` in the owning collection's
//! auxiliary metadata. Read/modify/write is not atomic across processes;
//! the coordinator registry guarantees a single writer per identity.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::store::LocalValueStore;
use crate::transport::ResponseHeaders;

use super::identity::ReplicationIdentity;

const PREFIX: &str = "sync_checkpoint";

/// Pull progress for one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_page: Option<u64>,
    pub last_modified_watermark: Option<String>,
    pub complete_initial_sync: bool,
    pub remote_total: Option<u64>,
    pub total_pages: Option<u64>,
}

impl Checkpoint {
    /// Advances the cursor after a successful page apply.
    ///
    /// `complete_initial_sync` is monotonic: once true it never reverts,
    /// even when a later audit re-opens paging.
    pub fn advance(&mut self, headers: &ResponseHeaders, page_watermark: Option<String>) {
        let current_page = self.next_page.unwrap_or(1);
        self.next_page = headers.next_page(current_page);
        if let Some(total) = headers.total {
            self.remote_total = Some(total);
        }
        if let Some(pages) = headers.total_pages {
            self.total_pages = Some(pages);
        }
        if let Some(watermark) = page_watermark {
            let newer = self
                .last_modified_watermark
                .as_deref()
                .map(|current| watermark.as_str() > current)
                .unwrap_or(true);
            if newer {
                self.last_modified_watermark = Some(watermark);
            }
        }
        if self.next_page.is_none() {
            self.complete_initial_sync = true;
        }
    }
}

/// Loads and saves checkpoints from the local store's auxiliary key-value
/// facility.
pub struct CheckpointStore {
    meta: Arc<dyn LocalValueStore>,
    collection: String,
}

impl CheckpointStore {
    pub fn new(meta: Arc<dyn LocalValueStore>, collection: impl Into<String>) -> Self {
        Self {
            meta,
            collection: collection.into(),
        }
    }

    fn key(identity: &ReplicationIdentity) -> String {
        format!("{}:{}", PREFIX, identity)
    }

    pub async fn load(&self, identity: &ReplicationIdentity) -> Result<Option<Checkpoint>> {
        let value = self
            .meta
            .get_local(&self.collection, &Self::key(identity))
            .await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, identity: &ReplicationIdentity, checkpoint: &Checkpoint) -> Result<()> {
        let value = serde_json::to_value(checkpoint)?;
        self.meta
            .set_local(&self.collection, &Self::key(identity), &value)
            .await
    }

    pub async fn clear(&self, identity: &ReplicationIdentity) -> Result<()> {
        self.meta
            .remove_local(&self.collection, &Self::key(identity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn identity() -> ReplicationIdentity {
        ReplicationIdentity::new("till-1", "products", &json!({}))
    }

    #[test]
    fn checkpoint_key_format() {
        let id = identity();
        assert_eq!(
            CheckpointStore::key(&id),
            format!("sync_checkpoint:{}", id)
        );
    }

    #[tokio::test]
    async fn load_save_round_trip() {
        let store = MemoryStore::new();
        let cps = CheckpointStore::new(store, "products");
        let id = identity();

        assert!(cps.load(&id).await.unwrap().is_none());

        let cp = Checkpoint {
            next_page: Some(3),
            last_modified_watermark: Some("2026-01-01T00:00:00".to_string()),
            complete_initial_sync: false,
            remote_total: Some(120),
            total_pages: Some(12),
        };
        cps.save(&id, &cp).await.unwrap();
        assert_eq!(cps.load(&id).await.unwrap(), Some(cp));

        cps.clear(&id).await.unwrap();
        assert!(cps.load(&id).await.unwrap().is_none());
    }

    #[test]
    fn advance_follows_pagination_headers() {
        let mut cp = Checkpoint::default();
        let headers = ResponseHeaders {
            total: Some(30),
            total_pages: Some(3),
            link: None,
        };
        cp.advance(&headers, Some("2026-01-01T00:00:00".to_string()));
        assert_eq!(cp.next_page, Some(2));
        assert!(!cp.complete_initial_sync);
        assert_eq!(cp.remote_total, Some(30));

        cp.advance(&headers, None);
        assert_eq!(cp.next_page, Some(3));

        cp.advance(&headers, Some("2026-01-02T00:00:00".to_string()));
        assert_eq!(cp.next_page, None);
        assert!(cp.complete_initial_sync);
        assert_eq!(
            cp.last_modified_watermark.as_deref(),
            Some("2026-01-02T00:00:00")
        );
    }

    #[test]
    fn complete_initial_sync_is_monotonic() {
        let mut cp = Checkpoint::default();
        let last = ResponseHeaders {
            total: Some(5),
            total_pages: Some(1),
            link: None,
        };
        cp.advance(&last, None);
        assert!(cp.complete_initial_sync);

        // A later page fetch (audit re-opened paging) keeps the flag set.
        let more = ResponseHeaders {
            total: Some(8),
            total_pages: Some(2),
            link: None,
        };
        cp.next_page = Some(1);
        cp.advance(&more, None);
        assert_eq!(cp.next_page, Some(2));
        assert!(cp.complete_initial_sync);
    }

    #[test]
    fn watermark_never_regresses() {
        let mut cp = Checkpoint {
            last_modified_watermark: Some("2026-05-01T00:00:00".to_string()),
            ..Default::default()
        };
        cp.advance(&ResponseHeaders::default(), Some("2026-01-01T00:00:00".to_string()));
        assert_eq!(
            cp.last_modified_watermark.as_deref(),
            Some("2026-05-01T00:00:00")
        );
    }
}
