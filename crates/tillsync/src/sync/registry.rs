//! Keeps at most one coordinator per replication identity.
//!
//! Multiple UI surfaces showing the same collection with the same query
//! shape must share one pull loop; the registry is the single-flight map
//! that guarantees it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::query::state::QueryState;
use crate::resource::ResourceKind;

use super::coordinator::Coordinator;
use super::identity::ReplicationIdentity;

#[derive(Default)]
pub struct CoordinatorRegistry {
    coordinators: Mutex<HashMap<ReplicationIdentity, Arc<Coordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the coordinator registered for `{kind, query}`, calling
    /// `create` under the map lock when none exists. The factory must not
    /// block.
    pub fn get_or_create<F>(
        &self,
        kind: ResourceKind,
        query: &QueryState,
        device_scope: &str,
        create: F,
    ) -> Arc<Coordinator>
    where
        F: FnOnce() -> Arc<Coordinator>,
    {
        let identity =
            ReplicationIdentity::new(device_scope, kind.endpoint(), &query.query_shape());
        let mut map = self.coordinators.lock();
        if let Some(existing) = map.get(&identity) {
            return existing.clone();
        }
        debug!("registering coordinator {} ({})", identity, kind);
        let coordinator = create();
        map.insert(identity, coordinator.clone());
        coordinator
    }

    pub fn get(&self, identity: &ReplicationIdentity) -> Option<Arc<Coordinator>> {
        self.coordinators.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.coordinators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.lock().is_empty()
    }

    /// Cancels and removes one coordinator. The entry stays in the map
    /// until the cancel resolves, so a concurrent `get_or_create` keeps
    /// resolving to the draining coordinator instead of minting a second
    /// poller for the same identity.
    pub async fn release(&self, identity: &ReplicationIdentity) {
        let existing = self.coordinators.lock().get(identity).cloned();
        if let Some(coordinator) = existing {
            coordinator.cancel().await;
            self.coordinators.lock().remove(identity);
            debug!("released coordinator {}", identity);
        }
    }

    /// Cancels everything, for application shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Coordinator>> =
            self.coordinators.lock().values().cloned().collect();
        for coordinator in all {
            coordinator.cancel().await;
        }
        self.coordinators.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::scheduler::RequestScheduler;
    use crate::store::memory::MemoryStore;
    use crate::transport::{HttpMethod, Params, RemoteResponse, RestTransport};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NullTransport;

    #[async_trait]
    impl RestTransport for NullTransport {
        async fn request(
            &self,
            _method: HttpMethod,
            _url: &str,
            _params: &Params,
            _body: Option<&Value>,
        ) -> crate::error::Result<RemoteResponse> {
            Ok(RemoteResponse { data: json!([]), headers: Default::default() })
        }
    }

    /// Slow enough that a pull is still in flight when release begins.
    struct StalledTransport {
        calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl RestTransport for StalledTransport {
        async fn request(
            &self,
            _method: HttpMethod,
            _url: &str,
            _params: &Params,
            _body: Option<&Value>,
        ) -> crate::error::Result<RemoteResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(RemoteResponse { data: json!([]), headers: Default::default() })
        }
    }

    fn make(kind: ResourceKind, query: &QueryState) -> (CoordinatorRegistry, Arc<Coordinator>) {
        let registry = CoordinatorRegistry::new();
        let coordinator = build(&registry, kind, query);
        (registry, coordinator)
    }

    fn build(
        registry: &CoordinatorRegistry,
        kind: ResourceKind,
        query: &QueryState,
    ) -> Arc<Coordinator> {
        build_with(registry, kind, query, Arc::new(NullTransport))
    }

    fn build_with(
        registry: &CoordinatorRegistry,
        kind: ResourceKind,
        query: &QueryState,
        transport: Arc<dyn RestTransport>,
    ) -> Arc<Coordinator> {
        let store = MemoryStore::new();
        let config = SyncConfig {
            base_url: "https://example.com".to_string(),
            device_scope: "till-1".to_string(),
            ..Default::default()
        };
        let scheduler = RequestScheduler::start(transport, config.scheduler_config());
        let q = query.clone();
        registry.get_or_create(kind, query, "till-1", move || {
            Coordinator::new(kind, q, store.clone(), store, scheduler, config)
        })
    }

    #[tokio::test]
    async fn same_identity_shares_one_coordinator() {
        let query = QueryState::default();
        let (registry, first) = make(ResourceKind::Product, &query);
        let second = build(&registry, ResourceKind::Product, &query);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn different_queries_get_different_coordinators() {
        let plain = QueryState::default();
        let searched = QueryState::default().with_search("beanie");
        let (registry, first) = make(ResourceKind::Product, &plain);
        let second = build(&registry, ResourceKind::Product, &searched);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn release_cancels_and_removes() {
        let query = QueryState::default();
        let (registry, coordinator) = make(ResourceKind::Product, &query);
        let identity = coordinator.identity().clone();

        registry.release(&identity).await;
        assert!(registry.get(&identity).is_none());
        assert!(!coordinator.status().active);

        // A later request for the same identity gets a fresh coordinator.
        let fresh = build(&registry, ResourceKind::Product, &query);
        assert!(fresh.status().active);
    }

    #[tokio::test(start_paused = true)]
    async fn release_keeps_the_entry_until_the_pull_drains() {
        let query = QueryState::default();
        let transport = Arc::new(StalledTransport {
            calls: std::sync::atomic::AtomicU64::new(0),
        });
        let registry = Arc::new(CoordinatorRegistry::new());
        let coordinator =
            build_with(&registry, ResourceKind::Product, &query, transport.clone());
        coordinator.start();
        while transport.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let identity = coordinator.identity().clone();
        let releasing = tokio::spawn({
            let registry = registry.clone();
            let identity = identity.clone();
            async move { registry.release(&identity).await }
        });
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }

        // While the old pull drains, the identity must keep resolving to
        // the same coordinator instead of minting a second poller.
        assert!(!releasing.is_finished());
        assert!(registry.get(&identity).is_some());
        let during = build(&registry, ResourceKind::Product, &query);
        assert!(Arc::ptr_eq(&coordinator, &during));

        releasing.await.unwrap();
        assert!(registry.get(&identity).is_none());
        assert!(!coordinator.status().active);
    }
}
