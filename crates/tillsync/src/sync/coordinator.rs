//! Replication coordinator: owns the pull loop for one
//! `{store, endpoint, query shape}` identity.
//!
//! Per cycle the coordinator merges checkpoint + audit + translated params
//! into one request, applies the response, and advances the checkpoint.
//! Pulls for one identity are strictly sequential; the state guard refuses
//! a new pull while one is in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, TillSyncError};
use crate::query::state::QueryState;
use crate::query::translate::translate;
use crate::resource::ResourceKind;
use crate::scheduler::RequestScheduler;
use crate::store::{LocalStore, LocalValueStore};
use crate::transport::HttpMethod;

use super::applier;
use super::audit::Auditor;
use super::checkpoint::CheckpointStore;
use super::identity::ReplicationIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Pulling,
    Applying,
    Failed,
    /// Terminal; reachable from any state.
    Cancelled,
}

/// Snapshot of a coordinator for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub active: bool,
    pub state: CoordinatorState,
}

/// What one pull cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// Another pull was already in flight, or there was nothing safe to do.
    Skipped,
    /// A page was applied; count of upserted records.
    Applied(usize),
    /// Nothing left to fetch; tombstones applied, checkpoint complete.
    Complete,
}

pub struct Coordinator {
    identity: ReplicationIdentity,
    kind: ResourceKind,
    query: QueryState,
    store: Arc<dyn LocalStore>,
    scheduler: Arc<RequestScheduler>,
    checkpoints: CheckpointStore,
    auditor: Auditor,
    config: SyncConfig,
    state: Mutex<CoordinatorState>,
    /// Audit `include` IDs not yet fetched in the current audit epoch.
    pending_includes: Mutex<(u64, VecDeque<u64>)>,
    resync_requested: AtomicBool,
    resync_notify: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        kind: ResourceKind,
        query: QueryState,
        store: Arc<dyn LocalStore>,
        meta: Arc<dyn LocalValueStore>,
        scheduler: Arc<RequestScheduler>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let identity =
            ReplicationIdentity::new(&config.device_scope, kind.endpoint(), &query.query_shape());
        let checkpoints = CheckpointStore::new(meta.clone(), kind.collection());
        let auditor = Auditor::new(
            kind,
            store.clone(),
            meta,
            scheduler.clone(),
            config.base_url.clone(),
            config.audit_interval(),
            config.audit_page_size,
        );
        Arc::new(Self {
            identity,
            kind,
            query,
            store,
            scheduler,
            checkpoints,
            auditor,
            config,
            state: Mutex::new(CoordinatorState::Idle),
            pending_includes: Mutex::new((0, VecDeque::new())),
            resync_requested: AtomicBool::new(false),
            resync_notify: Notify::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &ReplicationIdentity {
        &self.identity
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Starts the pull loop. Idempotent: a second `start` on a running
    /// coordinator is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        info!("coordinator {} ({}) started", self.identity, self.kind);
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Requests one out-of-band pull that ignores `complete_initial_sync`
    /// and forces an audit refresh.
    pub fn resync(&self) {
        self.resync_requested.store(true, Ordering::SeqCst);
        self.resync_notify.notify_one();
    }

    /// Cancels the loop and waits for it to wind down. Safe to call while
    /// a pull is in flight: the request completes but its result is
    /// discarded and the checkpoint is not advanced.
    pub async fn cancel(&self) {
        self.cancel.cancel();
        self.resync_notify.notify_one();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.state.lock() = CoordinatorState::Cancelled;
        info!("coordinator {} ({}) cancelled", self.identity, self.kind);
    }

    pub fn status(&self) -> SyncStatus {
        let state = *self.state.lock();
        SyncStatus {
            active: state != CoordinatorState::Cancelled && !self.cancel.is_cancelled(),
            state,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let forced = self.resync_requested.swap(false, Ordering::SeqCst);
            let outcome = self.pull_once(forced).await;
            let more_pending = match outcome {
                Ok(PullOutcome::Applied(n)) => {
                    debug!("{} pull applied {} records", self.kind, n);
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    // Background failures are logged, never surfaced; the
                    // next tick retries with the unchanged checkpoint.
                    warn!("{} pull failed: {}", self.kind, e);
                    false
                }
            };
            let wait = if more_pending {
                self.config.page_interval()
            } else {
                // Jitter spreads many idle pollers so their ticks do not
                // align into request bursts.
                let jitter = rand::thread_rng().gen_range(0..=250);
                self.config.resync_interval() + std::time::Duration::from_millis(jitter)
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.resync_notify.notified() => {}
            }
        }
        *self.state.lock() = CoordinatorState::Cancelled;
    }

    /// Runs one pull cycle unless another is already in flight.
    pub async fn pull_once(&self, forced: bool) -> Result<PullOutcome> {
        {
            let mut state = self.state.lock();
            match *state {
                CoordinatorState::Idle | CoordinatorState::Failed => {
                    *state = CoordinatorState::Pulling
                }
                _ => return Ok(PullOutcome::Skipped),
            }
        }
        let result = self.pull_cycle(forced).await;
        let mut state = self.state.lock();
        if *state != CoordinatorState::Cancelled {
            *state = match &result {
                Ok(_) => CoordinatorState::Idle,
                Err(_) => CoordinatorState::Failed,
            };
        }
        result
    }

    async fn pull_cycle(&self, forced: bool) -> Result<PullOutcome> {
        let mut checkpoint = self
            .checkpoints
            .load(&self.identity)
            .await?
            .unwrap_or_default();

        let audit = match self.auditor.status(forced).await {
            Ok(status) => Some(status),
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                // Degrade to checkpoint-only pulls rather than halting.
                warn!("{} audit unavailable: {}", self.kind, e);
                None
            }
        };

        let per_page = self.scheduler.batch_size() as u64;
        let translated = translate(self.kind, &self.query, checkpoint.next_page, per_page);

        if translated.unscoped {
            let Some(audit) = audit else {
                // An unscoped fetch without an audit would be a pathological
                // full-collection refetch; skip this cycle.
                return Ok(PullOutcome::Skipped);
            };

            {
                let mut pending = self.pending_includes.lock();
                if pending.0 != audit.epoch {
                    *pending = (audit.epoch, audit.include.iter().copied().collect());
                }
            }
            let chunk: Vec<u64> = {
                let mut pending = self.pending_includes.lock();
                let take = (per_page as usize).min(pending.1.len());
                pending.1.drain(..take).collect()
            };

            if chunk.is_empty() {
                self.apply_tombstones(&audit.remove).await?;
                if !checkpoint.complete_initial_sync {
                    checkpoint.complete_initial_sync = true;
                    checkpoint.next_page = None;
                    self.checkpoints.save(&self.identity, &checkpoint).await?;
                }
                return Ok(PullOutcome::Complete);
            }

            let mut params = translated.params;
            params.remove("page");
            params.insert(
                "include".to_string(),
                chunk.iter().map(u64::to_string).collect::<Vec<_>>().join(","),
            );
            let response = self
                .scheduler
                .submit(HttpMethod::Get, self.url(), params, self.priority())
                .await;
            if self.cancel.is_cancelled() {
                // Discard the in-flight result; the checkpoint stays put.
                return Err(TillSyncError::Cancelled);
            }
            let response = response?;

            *self.state.lock() = CoordinatorState::Applying;
            let applied = applier::apply_page(&self.store, self.kind, &response.records()).await?;
            self.apply_tombstones(&audit.remove).await?;

            if let Some(total) = response.headers.total {
                checkpoint.remote_total = Some(total);
            }
            if let Some(watermark) = applied.max_modified.clone() {
                let newer = checkpoint
                    .last_modified_watermark
                    .as_deref()
                    .map(|m| watermark.as_str() > m)
                    .unwrap_or(true);
                if newer {
                    checkpoint.last_modified_watermark = Some(watermark);
                }
            }
            if self.pending_includes.lock().1.is_empty() {
                checkpoint.complete_initial_sync = true;
            }
            self.checkpoints.save(&self.identity, &checkpoint).await?;
            return Ok(PullOutcome::Applied(applied.upserts));
        }

        // Scoped query: checkpointed page fetch. After the initial sync the
        // watermark bounds an incremental fetch for timestamped resources.
        let mut params = translated.params;
        if self.kind.supports_modified_after() && checkpoint.complete_initial_sync && !forced {
            if let Some(watermark) = &checkpoint.last_modified_watermark {
                params.insert("modified_after".to_string(), watermark.clone());
            }
        }
        let current_page = checkpoint.next_page.unwrap_or(1);
        params.insert("page".to_string(), current_page.to_string());

        let response = self
            .scheduler
            .submit(HttpMethod::Get, self.url(), params, self.priority())
            .await;
        if self.cancel.is_cancelled() {
            return Err(TillSyncError::Cancelled);
        }
        let response = response?;

        *self.state.lock() = CoordinatorState::Applying;
        let applied = applier::apply_page(&self.store, self.kind, &response.records()).await?;
        if let Some(audit) = &audit {
            self.apply_tombstones(&audit.remove).await?;
        }

        checkpoint.next_page = Some(current_page);
        checkpoint.advance(&response.headers, applied.max_modified.clone());
        self.checkpoints.save(&self.identity, &checkpoint).await?;

        if checkpoint.next_page.is_none() {
            Ok(PullOutcome::Complete)
        } else {
            Ok(PullOutcome::Applied(applied.upserts))
        }
    }

    async fn apply_tombstones(&self, removes: &[super::audit::Tombstone]) -> Result<()> {
        if removes.is_empty() {
            return Ok(());
        }
        applier::apply_tombstones(&self.store, self.kind, removes).await?;
        Ok(())
    }

    fn url(&self) -> String {
        format!("{}/{}", self.config.base_url, self.kind.endpoint())
    }

    fn priority(&self) -> crate::scheduler::RequestPriority {
        self.kind.pull_priority(self.query.has_search())
    }
}
