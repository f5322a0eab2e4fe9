//! Per-key checkpoints recording when a topic or subscriber last saw
//! traffic. Writes go through the bulk engine and are only durable after a
//! flush; reads go straight to the store, so a caller that needs
//! read-your-writes must flush first.

use crate::bulk::{BulkEngine, BulkError};
use crate::now_millis;
use ripple_store::{DocPath, DocStore, StoreError, WriteOp};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

pub const CHECKPOINT_KIND: &str = "checkpoint";

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DocStore>,
    bulk: BulkEngine,
    index: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DocStore>, bulk: BulkEngine, index: impl Into<String>) -> Self {
        Self {
            store,
            bulk,
            index: index.into(),
        }
    }

    /// Stamps `key` with the current time. Buffered, not yet durable.
    pub async fn checkpoint(&self, key: &str) -> Result<(), BulkError> {
        self.bulk
            .add(WriteOp::Index {
                index: self.index.clone(),
                kind: CHECKPOINT_KIND.into(),
                id: Some(key.to_string()),
                source: json!({"timestamp": now_millis()}),
            })
            .await
    }

    /// Forces buffered checkpoints out to the store.
    pub async fn flush(&self) -> Result<(), BulkError> {
        self.bulk.flush().await
    }

    /// When `key` was last checkpointed, or `None` for a key never seen.
    /// May lag behind unflushed `checkpoint` calls.
    pub async fn checkpointed_at(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let path = DocPath::new(self.index.clone(), CHECKPOINT_KIND, key);
        let timestamp = self
            .store
            .get(&path)
            .await?
            .as_ref()
            .and_then(|source| source.get("timestamp"))
            .and_then(Value::as_u64);
        if timestamp.is_none() {
            warn!(key, "no checkpoint recorded");
        }
        Ok(timestamp)
    }
}
