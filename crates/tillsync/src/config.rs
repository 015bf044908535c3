//! Runtime configuration and the top-level service context.
//!
//! `SyncConfig` is plain data so hosts can build it from whatever settings
//! surface they have. `SyncContext` wires the shared pieces (store,
//! scheduler, coordinator registry) together for embedding.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TillSyncError};
use crate::query::state::QueryState;
use crate::resource::ResourceKind;
use crate::scheduler::{RequestScheduler, SchedulerConfig};
use crate::store::{LocalStore, LocalValueStore};
use crate::sync::coordinator::Coordinator;
use crate::sync::identity::ReplicationIdentity;
use crate::sync::registry::CoordinatorRegistry;
use crate::transport::HttpTransport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root of the REST API, without a trailing slash.
    pub base_url: String,
    /// Distinguishes replication state between devices (and users on a
    /// shared device) pointing at the same server.
    pub device_scope: String,
    /// How long a reconciliation result stays fresh.
    pub audit_interval_secs: u64,
    /// Idle delay between pull cycles once a replication is caught up.
    pub resync_interval_secs: u64,
    /// Pacing delay between consecutive pages of one replication.
    pub page_interval_millis: u64,
    /// Starting request batch size; also the initial page size.
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    /// Page size for ID-only audit dumps, which are much cheaper than
    /// full records.
    pub audit_page_size: u64,
    pub request_timeout_secs: u64,
    /// When true, a server-rejected patch restores the field values the
    /// patch overwrote.
    pub rollback_rejected_patch: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            device_scope: "default".to_string(),
            audit_interval_secs: 600,
            resync_interval_secs: 600,
            page_interval_millis: 500,
            initial_batch_size: 5,
            max_batch_size: 25,
            audit_page_size: 1000,
            request_timeout_secs: 30,
            rollback_rejected_patch: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(TillSyncError::Config("base_url must be set".to_string()));
        }
        if self.base_url.ends_with('/') {
            return Err(TillSyncError::Config(
                "base_url must not end with a slash".to_string(),
            ));
        }
        if self.initial_batch_size == 0 || self.max_batch_size < self.initial_batch_size {
            return Err(TillSyncError::Config(
                "batch sizes must satisfy 0 < initial <= max".to_string(),
            ));
        }
        Ok(())
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            initial_batch_size: self.initial_batch_size,
            max_batch_size: self.max_batch_size,
            ..SchedulerConfig::default()
        }
    }
}

/// Everything a host application needs to replicate and query: one store,
/// one scheduler, one registry of coordinators keyed by replication
/// identity.
pub struct SyncContext {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    meta: Arc<dyn LocalValueStore>,
    scheduler: Arc<RequestScheduler>,
    registry: CoordinatorRegistry,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        meta: Arc<dyn LocalValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        let scheduler = RequestScheduler::start(transport, config.scheduler_config());
        Ok(Self {
            config,
            store,
            meta,
            scheduler,
            registry: CoordinatorRegistry::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    /// Returns the running coordinator for `{kind, query}`, creating and
    /// starting it on first use.
    pub fn coordinator(&self, kind: ResourceKind, query: &QueryState) -> Arc<Coordinator> {
        let store = self.store.clone();
        let meta = self.meta.clone();
        let scheduler = self.scheduler.clone();
        let config = self.config.clone();
        let factory_query = query.clone();
        let coordinator = self.registry.get_or_create(
            kind,
            query,
            &self.config.device_scope,
            move || Coordinator::new(kind, factory_query, store, meta, scheduler, config),
        );
        coordinator.start();
        coordinator
    }

    /// Cancels and drops the coordinator for one identity, typically when
    /// the last subscriber to its query goes away.
    pub async fn release(&self, identity: &ReplicationIdentity) {
        self.registry.release(identity).await;
    }

    /// Stops every coordinator and the scheduler.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.scheduler.shutdown();
    }
}
