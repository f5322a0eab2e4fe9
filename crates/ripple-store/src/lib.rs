//! Document store adapter for the ripple message bus.
//!
//! Topics, subscriptions, messages, and checkpoints are records in an
//! external document store. `DocStore` is the seam: the bus only needs
//! upserts, point reads, deletes, batched writes, and a restartable page
//! scan with a term filter and a timestamp lower bound. `MemoryStore`
//! backs tests and single-node development.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

mod memory;

pub use memory::MemoryStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Page size used by fanout scans unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// How long a scan cursor stays valid between page fetches.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cursor expired")]
    CursorExpired,
    #[error("backend: {0}")]
    Backend(String),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Fully-qualified record address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub index: String,
    pub kind: String,
    pub id: String,
}

impl DocPath {
    pub fn new(index: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// One operation in a bulk batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Index {
        index: String,
        kind: String,
        // None asks the store to assign an id.
        id: Option<String>,
        source: Value,
    },
    Delete {
        index: String,
        kind: String,
        id: String,
    },
}

/// Outcome of one bulk batch.
#[derive(Debug, Clone)]
pub struct BulkSummary {
    pub items: usize,
    pub failed: usize,
    pub took: Duration,
}

/// One record returned by a scan page.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// Scan parameters: exact-match term filter plus an optional inclusive
/// lower bound on a numeric `timestamp` field.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub index: String,
    pub kind: String,
    pub term: Option<(String, Value)>,
    pub min_timestamp: Option<u64>,
    pub page_size: usize,
    pub keep_alive: Duration,
}

impl ScanQuery {
    pub fn new(index: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            kind: kind.into(),
            term: None,
            min_timestamp: None,
            page_size: DEFAULT_PAGE_SIZE,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn term(mut self, field: impl Into<String>, value: Value) -> Self {
        self.term = Some((field.into(), value));
        self
    }

    pub fn min_timestamp(mut self, min: u64) -> Self {
        self.min_timestamp = Some(min);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Backend half of a scan cursor. Implementations return pages until
/// exhausted, then an empty page.
#[async_trait]
pub trait PageSource: Send {
    async fn next_page(&mut self) -> Result<Vec<Hit>>;
}

/// Restartable page iterator over a scan. An empty page signals completion.
/// Letting more than `keep_alive` pass between fetches invalidates the
/// cursor and fails with `StoreError::CursorExpired`.
pub struct Scroll {
    source: Box<dyn PageSource>,
    keep_alive: Duration,
    last_fetch: Instant,
}

impl Scroll {
    pub fn new(source: Box<dyn PageSource>, keep_alive: Duration) -> Self {
        Self {
            source,
            keep_alive,
            last_fetch: Instant::now(),
        }
    }

    pub async fn next_page(&mut self) -> Result<Vec<Hit>> {
        if self.last_fetch.elapsed() > self.keep_alive {
            return Err(StoreError::CursorExpired);
        }
        let page = self.source.next_page().await?;
        self.last_fetch = Instant::now();
        Ok(page)
    }
}

/// The document store the bus runs against.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Upserts one record, returning its id (assigned by the store when
    /// `id` is `None`).
    async fn index(
        &self,
        index: &str,
        kind: &str,
        id: Option<String>,
        source: Value,
    ) -> Result<String>;

    /// Point read of the source document.
    async fn get(&self, path: &DocPath) -> Result<Option<Value>>;

    /// Removes one record. Returns whether it existed.
    async fn delete(&self, path: &DocPath) -> Result<bool>;

    /// Applies a batch of writes. Individual failures are counted in the
    /// summary, not fatal.
    async fn bulk(&self, ops: Vec<WriteOp>) -> Result<BulkSummary>;

    /// Opens a page cursor over records matching the query, ordered by
    /// ascending `timestamp` where present.
    async fn scan(&self, query: ScanQuery) -> Result<Scroll>;
}
