//! Reactive local query pipeline.
//!
//! Watches one collection, recomputes the ordered ID list when the store
//! changes, and publishes it through a watch channel. Consecutive results
//! with the same ordering are suppressed so subscribers only wake up when
//! the visible list actually changed. Pagination is a window over the
//! published list and never triggers a recompute.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::store::{Document, LocalStore};

use super::state::{QueryState, SortDirection};

/// Page window over the ordered ID list. Lives outside the query state so
/// paging never changes the replication identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationWindow {
    pub page_size: usize,
    pub page_number: u64,
}

impl PaginationWindow {
    pub fn new(page_size: usize) -> Self {
        Self { page_size, page_number: 1 }
    }

    /// IDs visible through the window: pages 1..=page_number.
    fn visible<'a>(&self, ids: &'a [String]) -> &'a [String] {
        let end = (self.page_size * self.page_number as usize).min(ids.len());
        &ids[..end]
    }

    fn has_more(&self, total: usize) -> bool {
        self.page_size * (self.page_number as usize) < total
    }
}

pub struct QueryPipeline {
    store: Arc<dyn LocalStore>,
    collection: String,
    state: Mutex<QueryState>,
    window: Mutex<PaginationWindow>,
    ids_tx: watch::Sender<Vec<String>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueryPipeline {
    pub async fn open(
        store: Arc<dyn LocalStore>,
        collection: impl Into<String>,
        state: QueryState,
        page_size: usize,
    ) -> Result<Arc<Self>> {
        let collection = collection.into();
        let initial = compute_ids(&store, &collection, &state).await?;
        let (ids_tx, _) = watch::channel(initial);
        let pipeline = Arc::new(Self {
            store,
            collection,
            state: Mutex::new(state),
            window: Mutex::new(PaginationWindow::new(page_size)),
            ids_tx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        pipeline.spawn_watcher();
        Ok(pipeline)
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.store.subscribe(&self.collection);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(_) => this.refresh().await,
                        // Lagged: we only need "something changed".
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            this.refresh().await
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    async fn refresh(&self) {
        let state = self.state.lock().clone();
        match compute_ids(&self.store, &self.collection, &state).await {
            Ok(ids) => {
                // Distinct-until-changed: an identical ordering is dropped.
                self.ids_tx.send_if_modified(|current| {
                    if *current == ids {
                        false
                    } else {
                        *current = ids;
                        true
                    }
                });
            }
            Err(e) => warn!("query refresh for {} failed: {}", self.collection, e),
        }
    }

    /// Receiver over the full ordered ID list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.ids_tx.subscribe()
    }

    pub fn query(&self) -> QueryState {
        self.state.lock().clone()
    }

    /// Replaces the query and resets the window back to the first page.
    pub async fn set_query(&self, state: QueryState) {
        *self.state.lock() = state;
        self.window.lock().page_number = 1;
        self.refresh().await;
    }

    /// Ordered IDs visible through the current window.
    pub fn page_ids(&self) -> Vec<String> {
        let ids = self.ids_tx.borrow();
        self.window.lock().visible(&ids).to_vec()
    }

    /// Documents for the current window, in order. IDs whose records were
    /// removed between publish and fetch are skipped.
    pub async fn page_documents(&self) -> Result<Vec<Document>> {
        let ids = self.page_ids();
        let mut docs = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(doc) = self.store.get(&self.collection, id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    pub fn has_more(&self) -> bool {
        let total = self.ids_tx.borrow().len();
        self.window.lock().has_more(total)
    }

    /// Grows the window by one page. Returns false when everything is
    /// already visible.
    pub fn load_next_page(&self) -> bool {
        let total = self.ids_tx.borrow().len();
        let mut window = self.window.lock();
        if !window.has_more(total) {
            return false;
        }
        window.page_number += 1;
        true
    }

    pub fn window(&self) -> PaginationWindow {
        *self.window.lock()
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Runs search and selector against the store and returns the ordered IDs.
///
/// With search text present the candidate set is the search hits; the
/// structured selector then filters it. The final ordering always comes
/// from the sort field, not from search rank.
async fn compute_ids(
    store: &Arc<dyn LocalStore>,
    collection: &str,
    state: &QueryState,
) -> Result<Vec<String>> {
    let mut docs = if state.has_search() {
        let hits = store.search(collection, state.search.trim()).await?;
        let mut docs = Vec::with_capacity(hits.len());
        for id in &hits {
            if let Some(doc) = store.get(collection, id).await? {
                docs.push(doc);
            }
        }
        docs
    } else {
        store.all(collection).await?
    };
    docs.retain(|doc| state.selector.matches(doc));

    let sort_by = state.sort_by.clone();
    let direction = state.sort_direction;
    docs.sort_by(|a, b| {
        let ord = compare_field(a, b, &sort_by);
        let ord = match direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        // Equal keys fall back to local_id so the ordering is total and
        // stable across recomputes.
        ord.then_with(|| a.local_id.cmp(&b.local_id))
    });
    Ok(docs.into_iter().map(|d| d.local_id).collect())
}

fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    match (a.field(field), b.field(field)) {
        (Some(x), Some(y)) => compare_values(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        // Mixed types: order by type tag so the sort is still total.
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
