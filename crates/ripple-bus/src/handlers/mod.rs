//! Pub/sub command handlers.
//!
//! Handlers share one `PubSubContext` and are wired into the router at
//! startup. Subscription state, published messages, and checkpoints are
//! records in the document store, so any node on the same store sees them.

use crate::bulk::BulkEngine;
use crate::checkpoint::CheckpointStore;
use crate::peer::PeerForwarder;
use crate::registry::ConnectionRegistry;
use ripple_store::DocStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod docs;
mod forward;
mod publish;
mod subscribe;
mod unsubscribe;

pub use docs::{DeleteHandler, FlushHandler, IndexHandler};
pub use forward::ForwardHandler;
pub use publish::PublishHandler;
pub use subscribe::SubscribeHandler;
pub use unsubscribe::UnsubscribeHandler;

/// Record kind holding at most one row per subscriber.
pub const SUBSCRIPTION_KIND: &str = "subscription";
/// Topic used when a command names none.
pub const DEFAULT_TOPIC: &str = "*";

/// Everything a handler needs: the store, write batching, checkpoints,
/// local connections, and links to other nodes.
pub struct PubSubContext {
    pub store: Arc<dyn DocStore>,
    pub bulk: BulkEngine,
    pub checkpoints: CheckpointStore,
    pub registry: Arc<ConnectionRegistry>,
    pub peers: Arc<PeerForwarder>,
    /// Address other nodes use to reach this one.
    pub node_addr: String,
    /// Index all pub/sub records live in.
    pub index: String,
    pub scan_page_size: usize,
    pub scan_keep_alive: Duration,
}

/// Durable subscription record, stored at id = subscriber. A subscriber
/// holds at most one topic binding; re-subscribing replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub subscriber: String,
    pub connection_id: u64,
    pub node_addr: String,
    pub remote_addr: String,
}
