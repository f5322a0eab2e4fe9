use crate::{
    BulkSummary, DocPath, DocStore, Hit, PageSource, Result, ScanQuery, Scroll, WriteOp,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

/// In-memory document store.
///
/// ```
/// use ripple_store::{DocPath, DocStore, MemoryStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let id = store
///         .index("pubsub", "checkpoint", Some("k".into()), json!({"timestamp": 7}))
///         .await
///         .expect("index");
///     let doc = store
///         .get(&DocPath::new("pubsub", "checkpoint", id))
///         .await
///         .expect("get");
///     assert_eq!(doc, Some(json!({"timestamp": 7})));
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    // RwLock allows concurrent readers while writes take exclusive access.
    docs: RwLock<HashMap<DocPath, Value>>,
    // Monotonic counter backing store-assigned ids.
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn assign_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

fn timestamp_of(source: &Value) -> u64 {
    source.get("timestamp").and_then(Value::as_u64).unwrap_or(0)
}

fn matches(query: &ScanQuery, source: &Value) -> bool {
    if let Some((field, expected)) = &query.term
        && source.get(field) != Some(expected)
    {
        return false;
    }
    if let Some(min) = query.min_timestamp
        && timestamp_of(source) < min
    {
        return false;
    }
    true
}

// Snapshot cursor: pages are materialized at scan time, so writes after
// `scan` are not observed by an open cursor.
struct SnapshotSource {
    pages: VecDeque<Vec<Hit>>,
}

#[async_trait]
impl PageSource for SnapshotSource {
    async fn next_page(&mut self) -> Result<Vec<Hit>> {
        Ok(self.pages.pop_front().unwrap_or_default())
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn index(
        &self,
        index: &str,
        kind: &str,
        id: Option<String>,
        source: Value,
    ) -> Result<String> {
        let id = id.unwrap_or_else(|| self.assign_id());
        let path = DocPath::new(index, kind, id.clone());
        self.docs.write().await.insert(path, source);
        Ok(id)
    }

    async fn get(&self, path: &DocPath) -> Result<Option<Value>> {
        Ok(self.docs.read().await.get(path).cloned())
    }

    async fn delete(&self, path: &DocPath) -> Result<bool> {
        Ok(self.docs.write().await.remove(path).is_some())
    }

    async fn bulk(&self, ops: Vec<WriteOp>) -> Result<BulkSummary> {
        let start = Instant::now();
        let items = ops.len();
        let mut docs = self.docs.write().await;
        for op in ops {
            match op {
                WriteOp::Index {
                    index,
                    kind,
                    id,
                    source,
                } => {
                    let id = id.unwrap_or_else(|| self.assign_id());
                    docs.insert(DocPath::new(index, kind, id), source);
                }
                WriteOp::Delete { index, kind, id } => {
                    docs.remove(&DocPath::new(index, kind, id));
                }
            }
        }
        Ok(BulkSummary {
            items,
            failed: 0,
            took: start.elapsed(),
        })
    }

    async fn scan(&self, query: ScanQuery) -> Result<Scroll> {
        let docs = self.docs.read().await;
        let mut hits: Vec<Hit> = docs
            .iter()
            .filter(|(path, source)| {
                path.index == query.index && path.kind == query.kind && matches(&query, source)
            })
            .map(|(path, source)| Hit {
                id: path.id.clone(),
                source: source.clone(),
            })
            .collect();
        drop(docs);
        hits.sort_by(|a, b| {
            timestamp_of(&a.source)
                .cmp(&timestamp_of(&b.source))
                .then_with(|| a.id.cmp(&b.id))
        });
        let page_size = query.page_size.max(1);
        let pages = hits
            .chunks(page_size)
            .map(|chunk| chunk.to_vec())
            .collect::<VecDeque<_>>();
        Ok(Scroll::new(
            Box::new(SnapshotSource { pages }),
            query.keep_alive,
        ))
    }
}
