//! Full remote-ID-set vs local-ID-set reconciliation.
//!
//! Taxonomy-style resources have no reliable `modified_after` filter on the
//! remote side, so ID-set diffing is the only correct way to detect
//! additions and removals. The audit runs at coordinator start and on a
//! slow timer, not on every pull tick, to bound request volume.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, TillSyncError};
use crate::resource::ResourceKind;
use crate::scheduler::RequestScheduler;
use crate::store::{LocalStore, LocalValueStore};
use crate::transport::{HttpMethod, Params};

const SNAPSHOT_KEY: &str = "audit_snapshot";

/// Marker for a local record that no longer exists remotely. The audit
/// never hard-deletes; the coordinator applies tombstones as deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub local_id: String,
}

/// Result of one reconciliation pass.
///
/// Invariants: `include = R \ L` (plus modified-after refetches),
/// `remove` covers `L \ R`, `exclude = L ∩ R`, and `include` from the pure
/// set difference never intersects `remove`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditStatus {
    /// Remote IDs that must be fetched (absent locally, or edited
    /// server-side after the local watermark).
    pub include: Vec<u64>,
    /// Remote IDs already held locally, used to avoid re-fetching them.
    /// IDs tombstoned by this pass never appear here.
    pub exclude: Vec<u64>,
    /// Local records deleted server-side.
    pub remove: Vec<Tombstone>,
    /// Most recent local modification time, bounding incremental fetches.
    pub last_modified: Option<String>,
    /// True when the pure ID-set difference is empty.
    pub complete: bool,
    /// Incremented on every actual reconcile; a cached status keeps its
    /// epoch, so callers can tell a fresh diff from a reused one.
    pub epoch: u64,
}

pub struct Auditor {
    kind: ResourceKind,
    store: Arc<dyn LocalStore>,
    meta: Arc<dyn LocalValueStore>,
    scheduler: Arc<RequestScheduler>,
    base_url: String,
    /// Cached status stays valid for this long unless a refresh is forced.
    freshness: Duration,
    /// Page size for the ID dump and the bounded modified-after fetch.
    audit_page_size: u64,
    cache: Mutex<Option<(Instant, AuditStatus)>>,
    epoch: std::sync::atomic::AtomicU64,
}

impl Auditor {
    pub fn new(
        kind: ResourceKind,
        store: Arc<dyn LocalStore>,
        meta: Arc<dyn LocalValueStore>,
        scheduler: Arc<RequestScheduler>,
        base_url: impl Into<String>,
        freshness: Duration,
        audit_page_size: u64,
    ) -> Self {
        Self {
            kind,
            store,
            meta,
            scheduler,
            base_url: base_url.into(),
            freshness,
            audit_page_size,
            cache: Mutex::new(None),
            epoch: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Current audit status, recomputed when stale or when `force` is set.
    pub async fn status(&self, force: bool) -> Result<AuditStatus> {
        let mut cache = self.cache.lock().await;
        if !force {
            if let Some((fetched_at, status)) = cache.as_ref() {
                if fetched_at.elapsed() < self.freshness {
                    return Ok(status.clone());
                }
            }
        }
        let status = self.reconcile().await?;
        *cache = Some((Instant::now(), status.clone()));
        Ok(status)
    }

    async fn reconcile(&self) -> Result<AuditStatus> {
        // An authoritative dump is persisted so a later pass can fall back
        // to it when the remote is unreachable. The stale set may still
        // suggest records to fetch, but it must never drive tombstones.
        let (remote_ids, authoritative) = match self.fetch_remote_id_dump().await {
            Ok(ids) => {
                self.meta
                    .set_local(self.kind.collection(), SNAPSHOT_KEY, &json!(ids.clone()))
                    .await?;
                (ids, true)
            }
            Err(e) if !e.is_auth() => match self.load_snapshot().await? {
                Some(ids) => {
                    warn!("{} ID dump failed ({}), using persisted snapshot", self.kind, e);
                    (ids, false)
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let local_docs = self
            .store
            .all(self.kind.collection())
            .await
            .map_err(|e| TillSyncError::Reconciliation(e.to_string()))?;

        let remote_set: HashSet<u64> = remote_ids.iter().copied().collect();
        let local_set: HashSet<u64> = local_docs.iter().filter_map(|d| d.remote_id).collect();

        let mut include: Vec<u64> = remote_ids
            .iter()
            .copied()
            .filter(|id| !local_set.contains(id))
            .collect();
        // Unpushed optimistic records have no remote ID and are never
        // tombstoned by the audit.
        let remove: Vec<Tombstone> = if authoritative {
            local_docs
                .iter()
                .filter(|d| d.remote_id.map(|id| !remote_set.contains(&id)).unwrap_or(false))
                .map(|d| Tombstone {
                    local_id: d.local_id.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let mut exclude: Vec<u64> = local_set.intersection(&remote_set).copied().collect();
        exclude.sort_unstable();

        let complete = authoritative && include.is_empty();

        let last_modified = local_docs
            .iter()
            .filter_map(|d| d.date_modified)
            .max()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string());

        // Even a by-ID fully synced collection may hold stale copies of
        // records edited server-side; close that gap for resources with a
        // reliable modification timestamp.
        if authoritative && self.kind.supports_modified_after() {
            if let Some(watermark) = &last_modified {
                match self.fetch_modified_ids(watermark).await {
                    Ok(modified) => {
                        let known: HashSet<u64> = include.iter().copied().collect();
                        include.extend(modified.into_iter().filter(|id| !known.contains(id)));
                    }
                    Err(e) => {
                        // Degrades to the plain ID diff; the next audit
                        // retries the bounded fetch.
                        warn!("{} modified-after audit fetch failed: {}", self.kind, e);
                    }
                }
            }
        }

        debug!(
            "audit {}: include={} exclude={} remove={} complete={}",
            self.kind,
            include.len(),
            exclude.len(),
            remove.len(),
            complete
        );

        let epoch = self
            .epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;

        Ok(AuditStatus {
            include,
            exclude,
            remove,
            last_modified,
            complete,
            epoch,
        })
    }

    /// Authoritative unpaginated ID dump. This is the only request shape
    /// that asks the remote for all records at once.
    async fn fetch_remote_id_dump(&self) -> Result<Vec<u64>> {
        let mut params = Params::new();
        params.insert("fields".to_string(), "id".to_string());
        params.insert("per_page".to_string(), self.audit_page_size.to_string());
        let response = self
            .scheduler
            .submit(
                HttpMethod::Get,
                self.url(),
                params,
                self.kind.pull_priority(false),
            )
            .await
            .map_err(reconciliation_error)?;
        Ok(extract_ids(&response.records()))
    }

    /// Bounded fetch of IDs modified after the local watermark.
    async fn fetch_modified_ids(&self, watermark: &str) -> Result<Vec<u64>> {
        let mut params = Params::new();
        params.insert("fields".to_string(), "id".to_string());
        params.insert("modified_after".to_string(), watermark.to_string());
        params.insert("per_page".to_string(), self.audit_page_size.to_string());
        let response = self
            .scheduler
            .submit(
                HttpMethod::Get,
                self.url(),
                params,
                self.kind.pull_priority(false),
            )
            .await
            .map_err(reconciliation_error)?;
        Ok(extract_ids(&response.records()))
    }

    /// Last successfully fetched ID dump, if any.
    async fn load_snapshot(&self) -> Result<Option<Vec<u64>>> {
        let value = self
            .meta
            .get_local(self.kind.collection(), SNAPSHOT_KEY)
            .await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    fn url(&self) -> String {
        format!("{}/{}", self.base_url, self.kind.endpoint())
    }
}

/// Auth failures keep their class (they trigger re-authentication); other
/// audit failures degrade to reconciliation errors that never halt the
/// checkpointed pull path.
fn reconciliation_error(e: TillSyncError) -> TillSyncError {
    if e.is_auth() {
        e
    } else {
        TillSyncError::Reconciliation(e.to_string())
    }
}

fn extract_ids(records: &[Value]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_u64))
        .collect()
}
