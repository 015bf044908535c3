//! Optimistic local mutations pushed to the remote REST API.
//!
//! Writes land in the local store first so the UI reflects them
//! immediately, then go straight to the transport; they never queue behind
//! background pulls. A definitive server rejection (4xx) rolls the
//! optimistic write back; a network or server outage keeps it, to be
//! reconciled once the push succeeds on retry.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, TillSyncError};
use crate::resource::ResourceKind;
use crate::store::{Document, LocalStore};
use crate::transport::{HttpMethod, Params, RestTransport};

pub struct MutationPipeline {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn RestTransport>,
    base_url: String,
    rollback_rejected_patch: bool,
}

impl MutationPipeline {
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RestTransport>,
        base_url: impl Into<String>,
        rollback_rejected_patch: bool,
    ) -> Self {
        Self {
            store,
            transport,
            base_url: base_url.into(),
            rollback_rejected_patch,
        }
    }

    /// Creates a record optimistically and pushes it.
    ///
    /// On acceptance the server's canonical record (remote ID, computed
    /// fields, normalized values) is merged back under the same local ID.
    /// On rejection the optimistic record is removed.
    pub async fn create(&self, kind: ResourceKind, data: Value) -> Result<Document> {
        let collection = kind.collection();
        let doc = Document::new_local(data.clone());
        let local_id = doc.local_id.clone();
        self.store.insert(collection, doc).await?;

        let url = format!("{}/{}", self.base_url, kind.endpoint());
        match self
            .transport
            .request(HttpMethod::Post, &url, &Params::new(), Some(&data))
            .await
        {
            Ok(response) => {
                debug!("created {} {}", kind, local_id);
                self.store.patch(collection, &local_id, &response.data).await
            }
            Err(e) if is_rejection(&e) => {
                warn!("create of {} {} rejected: {}", kind, local_id, e);
                self.store.remove(collection, &local_id).await?;
                Err(TillSyncError::MutationRejected {
                    resource: collection.to_string(),
                    id: local_id,
                    message: e.to_string(),
                })
            }
            // Outage: the optimistic record stays and the caller may retry
            // the push later.
            Err(e) => Err(e),
        }
    }

    /// Applies a partial update optimistically and pushes it.
    ///
    /// A record that has never synced (no remote ID yet) is patched locally
    /// only; its fields ride along when the create eventually lands. When
    /// the server rejects the patch and rollback is enabled, the previous
    /// values of exactly the patched fields are restored.
    pub async fn patch(&self, kind: ResourceKind, local_id: &str, diff: Value) -> Result<Document> {
        let collection = kind.collection();
        let Some(diff_fields) = diff.as_object() else {
            return Err(TillSyncError::InvalidInput(
                "patch diff must be a JSON object".to_string(),
            ));
        };
        let prior = self
            .store
            .get(collection, local_id)
            .await?
            .ok_or_else(|| {
                TillSyncError::InvalidInput(format!("no {} record {}", collection, local_id))
            })?;
        let rollback_diff = prior_values(&prior, diff_fields);

        let patched = self.store.patch(collection, local_id, &diff).await?;
        let Some(remote_id) = patched.remote_id else {
            return Ok(patched);
        };

        let url = format!("{}/{}/{}", self.base_url, kind.endpoint(), remote_id);
        match self
            .transport
            .request(HttpMethod::Put, &url, &Params::new(), Some(&diff))
            .await
        {
            Ok(response) => self.store.patch(collection, local_id, &response.data).await,
            Err(e) if is_rejection(&e) => {
                warn!("patch of {} {} rejected: {}", kind, local_id, e);
                if self.rollback_rejected_patch {
                    self.store.patch(collection, local_id, &rollback_diff).await?;
                }
                Err(TillSyncError::MutationRejected {
                    resource: collection.to_string(),
                    id: local_id.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a record optimistically and pushes the delete. A rejected
    /// delete restores the record.
    pub async fn remove(&self, kind: ResourceKind, local_id: &str) -> Result<()> {
        let collection = kind.collection();
        let Some(doc) = self.store.get(collection, local_id).await? else {
            return Ok(());
        };
        self.store.remove(collection, local_id).await?;
        let Some(remote_id) = doc.remote_id else {
            return Ok(());
        };

        let url = format!("{}/{}/{}", self.base_url, kind.endpoint(), remote_id);
        let mut params = Params::new();
        params.insert("force".to_string(), "true".to_string());
        match self
            .transport
            .request(HttpMethod::Delete, &url, &params, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_rejection(&e) => {
                warn!("delete of {} {} rejected: {}", kind, local_id, e);
                self.store.upsert(collection, doc).await?;
                Err(TillSyncError::MutationRejected {
                    resource: collection.to_string(),
                    id: local_id.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// A definitive client-error response; auth failures and outages are not
/// rejections.
fn is_rejection(e: &TillSyncError) -> bool {
    if e.is_auth() {
        return false;
    }
    matches!(e.http_status(), Some(status) if (400..500).contains(&status))
}

/// Diff that restores the fields `diff` is about to overwrite. Fields the
/// record never had roll back to null.
fn prior_values(prior: &Document, diff_fields: &Map<String, Value>) -> Value {
    let mut rollback = Map::new();
    for key in diff_fields.keys() {
        let value = prior.field(key).cloned().unwrap_or(Value::Null);
        rollback.insert(key.clone(), value);
    }
    Value::Object(rollback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::transport::RemoteResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Replies with a canned result per call, or a canned error.
    struct PushTransport {
        replies: Mutex<Vec<Result<Value>>>,
        requests: Mutex<Vec<(HttpMethod, String, Option<Value>)>>,
    }

    impl PushTransport {
        fn new(replies: Vec<Result<Value>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RestTransport for PushTransport {
        async fn request(
            &self,
            method: HttpMethod,
            url: &str,
            _params: &Params,
            body: Option<&Value>,
        ) -> Result<RemoteResponse> {
            self.requests
                .lock()
                .push((method, url.to_string(), body.cloned()));
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(TillSyncError::Transport("no reply scripted".to_string()));
            }
            replies
                .remove(0)
                .map(|data| RemoteResponse { data, headers: Default::default() })
        }
    }

    fn pipeline(
        store: &Arc<MemoryStore>,
        transport: Arc<PushTransport>,
        rollback: bool,
    ) -> MutationPipeline {
        MutationPipeline::new(
            store.clone(),
            transport,
            "https://example.com/wp-json/wc/v3",
            rollback,
        )
    }

    #[tokio::test]
    async fn accepted_create_adopts_the_server_record() {
        let store = MemoryStore::new();
        let transport = PushTransport::new(vec![Ok(
            json!({"id": 101, "total": "18.00", "status": "processing"}),
        )]);
        let p = pipeline(&store, transport.clone(), true);

        let doc = p
            .create(ResourceKind::Order, json!({"status": "processing"}))
            .await
            .unwrap();
        assert_eq!(doc.remote_id, Some(101));
        assert_eq!(doc.field("total"), Some(&json!("18.00")));

        // The optimistic local ID survives, so open views keep their rows.
        let stored = store.get("orders", &doc.local_id).await.unwrap().unwrap();
        assert_eq!(stored.remote_id, Some(101));
        let (method, url, _) = transport.requests.lock()[0].clone();
        assert_eq!(method, HttpMethod::Post);
        assert!(url.ends_with("/orders"));
    }

    #[tokio::test]
    async fn rejected_create_rolls_back_the_insert() {
        let store = MemoryStore::new();
        let transport =
            PushTransport::new(vec![Err(TillSyncError::from_status(400, "invalid total"))]);
        let p = pipeline(&store, transport, true);

        let err = p
            .create(ResourceKind::Order, json!({"total": "-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TillSyncError::MutationRejected { .. }));
        assert!(store.all("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_create_keeps_the_optimistic_record() {
        let store = MemoryStore::new();
        let transport =
            PushTransport::new(vec![Err(TillSyncError::Transport("connection reset".to_string()))]);
        let p = pipeline(&store, transport, true);

        let err = p
            .create(ResourceKind::Order, json!({"status": "processing"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let docs = store.all("orders").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].remote_id, None);
    }

    #[tokio::test]
    async fn rejected_patch_restores_prior_fields() {
        let store = MemoryStore::new();
        store
            .upsert("products", Document::from_remote(json!({"id": 7, "price": "18.00"})))
            .await
            .unwrap();
        let local_id = store
            .find_by_remote_id("products", 7)
            .await
            .unwrap()
            .unwrap()
            .local_id;
        let transport =
            PushTransport::new(vec![Err(TillSyncError::from_status(400, "read only"))]);
        let p = pipeline(&store, transport, true);

        let err = p
            .patch(ResourceKind::Product, &local_id, json!({"price": "20.00"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TillSyncError::MutationRejected { .. }));
        let doc = store.get("products", &local_id).await.unwrap().unwrap();
        assert_eq!(doc.field("price"), Some(&json!("18.00")));
    }

    #[tokio::test]
    async fn rejected_patch_keeps_the_edit_when_rollback_is_off() {
        let store = MemoryStore::new();
        store
            .upsert("products", Document::from_remote(json!({"id": 7, "price": "18.00"})))
            .await
            .unwrap();
        let local_id = store
            .find_by_remote_id("products", 7)
            .await
            .unwrap()
            .unwrap()
            .local_id;
        let transport =
            PushTransport::new(vec![Err(TillSyncError::from_status(400, "read only"))]);
        let p = pipeline(&store, transport, false);

        assert!(p
            .patch(ResourceKind::Product, &local_id, json!({"price": "20.00"}))
            .await
            .is_err());
        let doc = store.get("products", &local_id).await.unwrap().unwrap();
        assert_eq!(doc.field("price"), Some(&json!("20.00")));
    }

    #[tokio::test]
    async fn patch_of_an_unsynced_record_stays_local() {
        let store = MemoryStore::new();
        let transport = PushTransport::new(vec![]);
        let p = pipeline(&store, transport.clone(), true);

        let doc = Document::new_local(json!({"status": "processing"}));
        let local_id = doc.local_id.clone();
        store.insert("orders", doc).await.unwrap();

        let patched = p
            .patch(ResourceKind::Order, &local_id, json!({"status": "completed"}))
            .await
            .unwrap();
        assert_eq!(patched.field("status"), Some(&json!("completed")));
        assert!(transport.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn accepted_patch_merges_the_server_echo() {
        let store = MemoryStore::new();
        store
            .upsert("orders", Document::from_remote(json!({"id": 5, "status": "processing"})))
            .await
            .unwrap();
        let local_id = store
            .find_by_remote_id("orders", 5)
            .await
            .unwrap()
            .unwrap()
            .local_id;
        let transport = PushTransport::new(vec![Ok(
            json!({"id": 5, "status": "completed", "date_modified_gmt": "2026-08-29T10:00:00"}),
        )]);
        let p = pipeline(&store, transport.clone(), true);

        let doc = p
            .patch(ResourceKind::Order, &local_id, json!({"status": "completed"}))
            .await
            .unwrap();
        assert_eq!(doc.field("status"), Some(&json!("completed")));
        let (method, url, _) = transport.requests.lock()[0].clone();
        assert_eq!(method, HttpMethod::Put);
        assert!(url.ends_with("/orders/5"));
    }

    #[tokio::test]
    async fn rejected_delete_restores_the_record() {
        let store = MemoryStore::new();
        store
            .upsert("orders", Document::from_remote(json!({"id": 5, "status": "processing"})))
            .await
            .unwrap();
        let local_id = store
            .find_by_remote_id("orders", 5)
            .await
            .unwrap()
            .unwrap()
            .local_id;
        let transport =
            PushTransport::new(vec![Err(TillSyncError::from_status(409, "order locked"))]);
        let p = pipeline(&store, transport, true);

        assert!(p.remove(ResourceKind::Order, &local_id).await.is_err());
        assert!(store.get("orders", &local_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_of_an_unsynced_record_is_local_only() {
        let store = MemoryStore::new();
        let transport = PushTransport::new(vec![]);
        let p = pipeline(&store, transport.clone(), true);

        let doc = Document::new_local(json!({"status": "draft"}));
        let local_id = doc.local_id.clone();
        store.insert("orders", doc).await.unwrap();

        p.remove(ResourceKind::Order, &local_id).await.unwrap();
        assert!(store.get("orders", &local_id).await.unwrap().is_none());
        assert!(transport.requests.lock().is_empty());
    }
}
