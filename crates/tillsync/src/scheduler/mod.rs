//! Shared outbound request scheduler.
//!
//! All coordinators submit their pulls here. Requests are dequeued in
//! priority order (FIFO within a band), identical queued or in-flight
//! requests share one network call, and work is executed in adaptively
//! sized concurrent batches.

pub mod priority;

pub use priority::RequestPriority;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TillSyncError};
use crate::transport::{HttpMethod, Params, RemoteResponse, RestTransport};

/// Identity of one outbound request; requests with equal keys share one
/// network call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub priority: u8,
    pub method: HttpMethod,
    pub url: String,
    pub params: Params,
}

type RequestResult = Result<RemoteResponse>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    /// A batch finishing faster than this grows the next batch.
    pub grow_threshold: Duration,
    /// A batch slower than this shrinks the next batch (floor 1).
    pub shrink_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 5,
            max_batch_size: 25,
            grow_threshold: Duration::from_secs(1),
            shrink_threshold: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    priority: u8,
    seq: u64,
    key: RequestKey,
}

// Ordered by (priority, seq); wrapped in `Reverse` for a min-heap, so the
// lowest priority value with the oldest sequence pops first.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Waiters per key, covering both queued and in-flight requests.
    waiters: HashMap<RequestKey, Vec<oneshot::Sender<RequestResult>>>,
    in_flight: HashSet<RequestKey>,
    seq: u64,
    batch_size: usize,
}

pub struct RequestScheduler {
    transport: Arc<dyn RestTransport>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl RequestScheduler {
    /// Creates the scheduler and spawns its batch worker.
    pub fn start(transport: Arc<dyn RestTransport>, config: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            transport,
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                waiters: HashMap::new(),
                in_flight: HashSet::new(),
                seq: 0,
                batch_size: config.initial_batch_size.max(1),
            }),
            config,
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let worker = scheduler.clone();
        tokio::spawn(async move { worker.run().await });
        scheduler
    }

    /// Submits one request and awaits its result. Identical queued or
    /// in-flight requests resolve from the same network call.
    pub async fn submit(
        &self,
        method: HttpMethod,
        url: impl Into<String>,
        params: Params,
        priority: RequestPriority,
    ) -> RequestResult {
        if self.shutdown.is_cancelled() {
            return Err(TillSyncError::Cancelled);
        }
        let key = RequestKey {
            priority: priority.value(),
            method,
            url: url.into(),
            params,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.waiters.get_mut(&key) {
                debug!("dedup joined pending request {}", key.url);
                existing.push(tx);
            } else {
                state.waiters.insert(key.clone(), vec![tx]);
                let seq = state.seq;
                state.seq += 1;
                state.heap.push(Reverse(HeapEntry {
                    priority: key.priority,
                    seq,
                    key,
                }));
            }
        }
        self.notify.notify_one();
        rx.await.unwrap_or(Err(TillSyncError::Cancelled))
    }

    /// Current adaptive batch size; coordinators use it as `per_page`.
    pub fn batch_size(&self) -> usize {
        self.state.lock().batch_size
    }

    /// Number of not-yet-dequeued requests, for diagnostics and tests.
    pub fn queued_len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Cancels the worker and fails every pending waiter.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_one();
        let mut state = self.state.lock();
        state.heap.clear();
        for (_, senders) in state.waiters.drain() {
            for sender in senders {
                let _ = sender.send(Err(TillSyncError::Cancelled));
            }
        }
        state.in_flight.clear();
    }

    async fn run(&self) {
        loop {
            let batch = self.pop_batch();
            if batch.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.notify.notified() => continue,
                }
            }

            let started = Instant::now();
            let results = join_all(batch.into_iter().map(|key| async move {
                let result = self
                    .transport
                    .request(key.method, &key.url, &key.params, None)
                    .await;
                (key, result)
            }))
            .await;
            let elapsed = started.elapsed();

            self.adapt_batch_size(elapsed);

            for (key, result) in results {
                if let Err(e) = &result {
                    if e.is_auth() {
                        warn!("auth failure on {}: re-authentication required", key.url);
                    }
                }
                let senders = {
                    let mut state = self.state.lock();
                    state.in_flight.remove(&key);
                    state.waiters.remove(&key).unwrap_or_default()
                };
                for sender in senders {
                    let _ = sender.send(result.clone());
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Pops up to `batch_size` entries in heap order. Once popped, a batch
    /// is never reordered.
    fn pop_batch(&self) -> Vec<RequestKey> {
        let mut state = self.state.lock();
        let size = state.batch_size;
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match state.heap.pop() {
                Some(Reverse(entry)) => {
                    state.in_flight.insert(entry.key.clone());
                    batch.push(entry.key);
                }
                None => break,
            }
        }
        batch
    }

    fn adapt_batch_size(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        if elapsed < self.config.grow_threshold && state.batch_size < self.config.max_batch_size {
            state.batch_size += 1;
            debug!("batch finished in {:?}, batch_size -> {}", elapsed, state.batch_size);
        } else if elapsed > self.config.shrink_threshold && state.batch_size > 1 {
            state.batch_size -= 1;
            debug!("batch took {:?}, batch_size -> {}", elapsed, state.batch_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Transport stub with a programmable delay, call counter and call log.
    struct StubTransport {
        delay: Mutex<Duration>,
        calls: AtomicU64,
        log: Mutex<Vec<String>>,
    }

    impl StubTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay: Mutex::new(delay),
                calls: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
            })
        }

        fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }
    }

    #[async_trait]
    impl RestTransport for StubTransport {
        async fn request(
            &self,
            _method: HttpMethod,
            url: &str,
            params: &Params,
            _body: Option<&Value>,
        ) -> RequestResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(url.to_string());
            let delay = *self.delay.lock();
            tokio::time::sleep(delay).await;
            Ok(RemoteResponse {
                data: json!([{"url": url, "page": params.get("page")}]),
                headers: Default::default(),
            })
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn params(page: u64) -> Params {
        let mut p = Params::new();
        p.insert("page".to_string(), page.to_string());
        p
    }

    #[tokio::test(start_paused = true)]
    async fn identical_requests_share_one_network_call() {
        let transport = StubTransport::new(Duration::from_millis(100));
        let scheduler = RequestScheduler::start(transport.clone(), SchedulerConfig::default());

        let a = scheduler.submit(HttpMethod::Get, "/products", params(1), RequestPriority::Catalog);
        let b = scheduler.submit(HttpMethod::Get, "/products", params(1), RequestPriority::Catalog);
        let (ra, rb) = tokio::join!(a, b);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ra.unwrap(), rb.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn different_params_are_not_deduplicated() {
        let transport = StubTransport::new(Duration::from_millis(10));
        let scheduler = RequestScheduler::start(transport.clone(), SchedulerConfig::default());

        let a = scheduler.submit(HttpMethod::Get, "/products", params(1), RequestPriority::Catalog);
        let b = scheduler.submit(HttpMethod::Get, "/products", params(2), RequestPriority::Catalog);
        let _ = tokio::join!(a, b);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn priority_orders_the_queue() {
        init_tracing();
        let transport = StubTransport::new(Duration::from_millis(1500));
        let config = SchedulerConfig {
            initial_batch_size: 1,
            ..Default::default()
        };
        let scheduler = RequestScheduler::start(transport.clone(), config);

        // The first submission must be in flight before the rest are
        // queued, so they drain in priority order regardless of insertion
        // order. Submitting is lazy; spawn it and wait for the worker to
        // pick it up.
        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .submit(HttpMethod::Get, "/first", Params::new(), RequestPriority::Order)
                    .await
            }
        });
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let tag = scheduler.submit(HttpMethod::Get, "/tags", Params::new(), RequestPriority::Taxonomy);
        let tax = scheduler.submit(HttpMethod::Get, "/taxes", Params::new(), RequestPriority::TaxRate);
        let product = scheduler.submit(HttpMethod::Get, "/products", Params::new(), RequestPriority::Catalog);
        let _ = tokio::join!(tag, tax, product);
        first.await.unwrap().unwrap();

        let log = transport.log.lock().clone();
        assert_eq!(log[0], "/first");
        assert_eq!(&log[1..], &["/taxes", "/products", "/tags"]);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_batch_size_grows_and_shrinks() {
        init_tracing();
        let transport = StubTransport::new(Duration::from_millis(400));
        let scheduler = RequestScheduler::start(transport.clone(), SchedulerConfig::default());
        assert_eq!(scheduler.batch_size(), 5);

        // One fast batch (400ms < 1s) grows the batch size.
        scheduler
            .submit(HttpMethod::Get, "/a", Params::new(), RequestPriority::Catalog)
            .await
            .unwrap();
        assert_eq!(scheduler.batch_size(), 6);

        // A slow batch (2.5s > 2s) shrinks it again.
        transport.set_delay(Duration::from_millis(2500));
        scheduler
            .submit(HttpMethod::Get, "/b", Params::new(), RequestPriority::Catalog)
            .await
            .unwrap();
        assert_eq!(scheduler.batch_size(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_waiters() {
        let transport = StubTransport::new(Duration::from_secs(10));
        let config = SchedulerConfig {
            initial_batch_size: 1,
            ..Default::default()
        };
        let scheduler = RequestScheduler::start(transport.clone(), config);

        let blocked = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .submit(HttpMethod::Get, "/a", Params::new(), RequestPriority::Catalog)
                    .await
            }
        });
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let queued = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .submit(HttpMethod::Get, "/b", Params::new(), RequestPriority::Catalog)
                    .await
            }
        });
        while scheduler.queued_len() == 0 {
            tokio::task::yield_now().await;
        }

        scheduler.shutdown();
        assert_eq!(queued.await.unwrap(), Err(TillSyncError::Cancelled));
        assert_eq!(blocked.await.unwrap(), Err(TillSyncError::Cancelled));
    }
}
