//! Batching write engine in front of the document store.
//!
//! Writes accumulate in a per-engine buffer and are flushed as one bulk
//! request when the buffer grows past `max_buffered_ops`, when the optional
//! interval timer fires, or on an explicit `flush`. Flush concurrency is
//! bounded by a semaphore; with `max_concurrent_flushes == 0` the flush runs
//! inline on the caller instead.

use crate::registry::ConnectionHandle;
use metrics::counter;
use parking_lot::Mutex;
use ripple_store::{BulkSummary, DocStore, StoreError, WriteOp};
use ripple_wire::ReplyFrame;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONCURRENT_FLUSHES: usize = 32;
pub const DEFAULT_MAX_BUFFERED_OPS: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("bulk engine already closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// In-flight flush limit. `0` runs every flush inline on the caller.
    pub max_concurrent_flushes: usize,
    /// Buffer size that triggers a flush once exceeded. `-1` disables the
    /// size trigger entirely.
    pub max_buffered_ops: i64,
    /// Optional periodic background flush.
    pub flush_interval: Option<Duration>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_concurrent_flushes: DEFAULT_MAX_CONCURRENT_FLUSHES,
            max_buffered_ops: DEFAULT_MAX_BUFFERED_OPS,
            flush_interval: None,
        }
    }
}

/// Callbacks around every executed batch. Execution ids are a per-engine
/// monotonic counter starting at 1.
pub trait BulkHooks: Send + Sync {
    fn before_batch(&self, execution_id: u64, ops: &[WriteOp]) {
        let _ = (execution_id, ops);
    }

    fn after_batch(
        &self,
        execution_id: u64,
        ops: &[WriteOp],
        outcome: &Result<BulkSummary, StoreError>,
    ) {
        let _ = (execution_id, ops, outcome);
    }
}

struct NoHooks;

impl BulkHooks for NoHooks {}

#[derive(Default)]
struct Buffer {
    ops: Vec<WriteOp>,
    reply: Option<ConnectionHandle>,
    closed: bool,
}

struct Batch {
    ops: Vec<WriteOp>,
    reply: Option<ConnectionHandle>,
}

fn take_batch(buffer: &mut Buffer) -> Batch {
    Batch {
        ops: std::mem::take(&mut buffer.ops),
        reply: buffer.reply.take(),
    }
}

struct Inner {
    store: Arc<dyn DocStore>,
    config: BulkConfig,
    hooks: Arc<dyn BulkHooks>,
    flights: Arc<Semaphore>,
    buffer: Mutex<Buffer>,
    executions: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle to one batching engine instance.
#[derive(Clone)]
pub struct BulkEngine {
    inner: Arc<Inner>,
}

impl BulkEngine {
    pub fn new(store: Arc<dyn DocStore>, config: BulkConfig) -> Self {
        Self::with_hooks(store, config, Arc::new(NoHooks))
    }

    pub fn with_hooks(
        store: Arc<dyn DocStore>,
        config: BulkConfig,
        hooks: Arc<dyn BulkHooks>,
    ) -> Self {
        let flights = Arc::new(Semaphore::new(config.max_concurrent_flushes));
        let inner = Arc::new(Inner {
            store,
            config,
            hooks,
            flights,
            buffer: Mutex::new(Buffer::default()),
            executions: AtomicU64::new(0),
            timer: Mutex::new(None),
        });
        let engine = Self { inner };
        engine.start_timer();
        engine
    }

    fn start_timer(&self) {
        let Some(interval) = self.inner.config.flush_interval else {
            return;
        };
        if interval.is_zero() {
            return;
        }
        // Weak reference so the timer never keeps a dropped engine alive.
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = BulkEngine { inner };
                // flush only fails once the engine is closed.
                if engine.flush().await.is_err() {
                    break;
                }
            }
        });
        *self.inner.timer.lock() = Some(handle);
    }

    /// Appends one operation, flushing when the size trigger fires.
    pub async fn add(&self, op: WriteOp) -> Result<(), BulkError> {
        self.push(op, None).await
    }

    /// Like `add`, but registers `reply` to receive the outcome of the
    /// batch this operation ends up in. When several operations in one
    /// batch carry reply targets, the last registered one wins.
    pub async fn add_with_reply(
        &self,
        op: WriteOp,
        reply: ConnectionHandle,
    ) -> Result<(), BulkError> {
        self.push(op, Some(reply)).await
    }

    async fn push(&self, op: WriteOp, reply: Option<ConnectionHandle>) -> Result<(), BulkError> {
        let batch = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.closed {
                return Err(BulkError::Closed);
            }
            buffer.ops.push(op);
            if let Some(reply) = reply {
                buffer.reply = Some(reply);
            }
            let threshold = self.inner.config.max_buffered_ops;
            if threshold >= 0 && buffer.ops.len() as i64 > threshold {
                Some(take_batch(&mut buffer))
            } else {
                None
            }
        };
        match batch {
            Some(batch) => self.submit(batch).await,
            None => Ok(()),
        }
    }

    /// Submits whatever is buffered right now. A no-op on an empty buffer.
    pub async fn flush(&self) -> Result<(), BulkError> {
        let batch = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.closed {
                return Err(BulkError::Closed);
            }
            if buffer.ops.is_empty() {
                return Ok(());
            }
            take_batch(&mut buffer)
        };
        self.submit(batch).await
    }

    /// Stops the interval timer, flushes the remainder, and marks the
    /// engine closed. Idempotent; later `add`/`flush` calls fail with
    /// `BulkError::Closed`.
    pub async fn close(&self) -> Result<(), BulkError> {
        let batch = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.closed {
                return Ok(());
            }
            buffer.closed = true;
            (!buffer.ops.is_empty()).then(|| take_batch(&mut buffer))
        };
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
        match batch {
            Some(batch) => self.submit(batch).await,
            None => Ok(()),
        }
    }

    async fn submit(&self, batch: Batch) -> Result<(), BulkError> {
        let execution_id = self.inner.executions.fetch_add(1, Ordering::Relaxed) + 1;
        if self.inner.config.max_concurrent_flushes == 0 {
            // Store failures reach the hooks and the reply target inside
            // execute; they do not surface out of add or flush.
            if let Err(err) = execute(&self.inner, execution_id, batch).await {
                warn!(execution_id, error = %err, "bulk flush failed");
            }
            return Ok(());
        }
        // Acquiring before the spawn backpressures producers once every
        // permit is held by an in-flight flush.
        let permit = self
            .inner
            .flights
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkError::Closed)?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = execute(&inner, execution_id, batch).await {
                warn!(execution_id, error = %err, "bulk flush failed");
            }
        });
        Ok(())
    }
}

async fn execute(
    inner: &Arc<Inner>,
    execution_id: u64,
    batch: Batch,
) -> Result<BulkSummary, StoreError> {
    let Batch { ops, reply } = batch;
    inner.hooks.before_batch(execution_id, &ops);
    debug!(execution_id, ops = ops.len(), "executing bulk batch");
    let outcome = inner.store.bulk(ops.clone()).await;
    inner.hooks.after_batch(execution_id, &ops, &outcome);
    match &outcome {
        Ok(summary) => {
            counter!("bulk_flush_total").increment(1);
            if let Some(reply) = reply {
                let frame = ReplyFrame::ok(
                    "bulk",
                    json!({
                        "items": summary.items,
                        "failed": summary.failed,
                        "took_ms": summary.took.as_millis() as u64,
                    }),
                );
                if reply.send(&frame).is_err() {
                    debug!(connection = %reply.id, "bulk reply dropped");
                }
            }
        }
        Err(err) => {
            counter!("bulk_flush_failed_total").increment(1);
            if let Some(reply) = reply {
                let _ = reply.send(&ReplyFrame::error("bulk", &err.to_string()));
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use bytes::Bytes;
    use ripple_store::MemoryStore;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sync_config() -> BulkConfig {
        BulkConfig {
            max_concurrent_flushes: 0,
            max_buffered_ops: DEFAULT_MAX_BUFFERED_OPS,
            flush_interval: None,
        }
    }

    fn index_op(id: &str) -> WriteOp {
        WriteOp::Index {
            index: "pubsub".into(),
            kind: "t".into(),
            id: Some(id.into()),
            source: json!({"n": id}),
        }
    }

    fn reply_conn(id: u64) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(ConnectionId(id), "test", tx), rx)
    }

    #[tokio::test]
    async fn size_trigger_flushes_past_threshold() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_buffered_ops: 2,
                ..sync_config()
            },
        );
        engine.add(index_op("a")).await.expect("add");
        engine.add(index_op("b")).await.expect("add");
        // At the threshold, not past it.
        assert_eq!(store.len().await, 0);
        engine.add(index_op("c")).await.expect("add");
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn negative_threshold_disables_size_trigger() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_buffered_ops: -1,
                ..sync_config()
            },
        );
        for n in 0..500 {
            engine.add(index_op(&n.to_string())).await.expect("add");
        }
        assert_eq!(store.len().await, 0);
        engine.flush().await.expect("flush");
        assert_eq!(store.len().await, 500);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(store.clone(), sync_config());
        engine.flush().await.expect("flush");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn close_flushes_remainder_and_rejects_later_calls() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(store.clone(), sync_config());
        engine.add(index_op("a")).await.expect("add");
        engine.close().await.expect("close");
        assert_eq!(store.len().await, 1);

        assert!(matches!(engine.add(index_op("b")).await, Err(BulkError::Closed)));
        assert!(matches!(engine.flush().await, Err(BulkError::Closed)));
        // Idempotent.
        engine.close().await.expect("close again");
    }

    #[tokio::test]
    async fn last_registered_reply_target_wins() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(store.clone(), sync_config());
        let (first, mut first_rx) = reply_conn(1);
        let (second, mut second_rx) = reply_conn(2);

        engine.add_with_reply(index_op("a"), first).await.expect("add");
        engine.add_with_reply(index_op("b"), second).await.expect("add");
        engine.flush().await.expect("flush");

        let frame = second_rx.recv().await.expect("reply");
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value["ok"], true);
        assert_eq!(value["type"], "bulk");
        assert_eq!(value["data"]["items"], 2);
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hooks_run_around_every_batch() {
        struct Recording {
            events: Mutex<Vec<String>>,
        }

        impl BulkHooks for Recording {
            fn before_batch(&self, execution_id: u64, ops: &[WriteOp]) {
                self.events
                    .lock()
                    .push(format!("before {execution_id} {}", ops.len()));
            }

            fn after_batch(
                &self,
                execution_id: u64,
                ops: &[WriteOp],
                outcome: &Result<BulkSummary, StoreError>,
            ) {
                self.events.lock().push(format!(
                    "after {execution_id} {} {}",
                    ops.len(),
                    outcome.is_ok()
                ));
            }
        }

        let hooks = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::with_hooks(store, sync_config(), hooks.clone());
        engine.add(index_op("a")).await.expect("add");
        engine.flush().await.expect("flush");
        engine.add(index_op("b")).await.expect("add");
        engine.flush().await.expect("flush");

        let events = hooks.events.lock().clone();
        assert_eq!(
            events,
            vec!["before 1 1", "after 1 1 true", "before 2 1", "after 2 1 true"]
        );
    }

    #[tokio::test]
    async fn background_mode_flushes_off_the_caller() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_concurrent_flushes: 2,
                max_buffered_ops: 0,
                flush_interval: None,
            },
        );
        engine.add(index_op("a")).await.expect("add");
        // The flush runs on a spawned task; wait for it to land.
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.len().await != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("flush landed");
    }

    /// Fails the first `failures_left` bulk calls, then behaves.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: std::sync::atomic::AtomicUsize,
    }

    impl FlakyStore {
        fn failing(count: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: std::sync::atomic::AtomicUsize::new(count),
            }
        }
    }

    #[async_trait::async_trait]
    impl DocStore for FlakyStore {
        async fn index(
            &self,
            index: &str,
            kind: &str,
            id: Option<String>,
            source: Value,
        ) -> ripple_store::Result<String> {
            self.inner.index(index, kind, id, source).await
        }

        async fn get(
            &self,
            path: &ripple_store::DocPath,
        ) -> ripple_store::Result<Option<Value>> {
            self.inner.get(path).await
        }

        async fn delete(&self, path: &ripple_store::DocPath) -> ripple_store::Result<bool> {
            self.inner.delete(path).await
        }

        async fn bulk(&self, ops: Vec<WriteOp>) -> ripple_store::Result<BulkSummary> {
            use std::sync::atomic::Ordering;
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("bulk down".into()));
            }
            self.inner.bulk(ops).await
        }

        async fn scan(
            &self,
            query: ripple_store::ScanQuery,
        ) -> ripple_store::Result<ripple_store::Scroll> {
            self.inner.scan(query).await
        }
    }

    #[tokio::test]
    async fn sync_flush_failure_replies_error_without_surfacing() {
        let store = Arc::new(FlakyStore::failing(1));
        let engine = BulkEngine::new(store, sync_config());
        let (reply, mut rx) = reply_conn(1);

        engine.add_with_reply(index_op("a"), reply).await.expect("add");
        engine.flush().await.expect("store failure stays inside the engine");

        let frame = rx.recv().await.expect("reply");
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value["ok"], false);
        assert_eq!(value["type"], "bulk");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_survives_a_failed_flush() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(FlakyStore::failing(1));
        let engine = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_concurrent_flushes: 0,
                max_buffered_ops: -1,
                flush_interval: Some(Duration::from_millis(100)),
            },
        );
        engine.add(index_op("a")).await.expect("add");

        // First tick flushes into the failure; the batch is lost but the
        // timer keeps ticking.
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.failures_left.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first flush attempted");

        engine.add(index_op("b")).await.expect("add");
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.inner.len().await != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("later flush landed");
        engine.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_flushes_buffered_ops() {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_concurrent_flushes: 0,
                max_buffered_ops: -1,
                flush_interval: Some(Duration::from_millis(100)),
            },
        );
        engine.add(index_op("a")).await.expect("add");
        assert_eq!(store.len().await, 0);

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.len().await != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timer flush landed");
        engine.close().await.expect("close");
    }
}
