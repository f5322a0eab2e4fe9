//! Core of the ripple message bus: bulk write engine, checkpoint store,
//! connection registry, command router, pub/sub handlers, and the
//! cross-node forwarder. Transport and the concrete document store live
//! in the embedding service.

use ripple_store::StoreError;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod bulk;
pub mod checkpoint;
pub mod handlers;
pub mod peer;
pub mod registry;
pub mod router;

pub use bulk::{BulkConfig, BulkEngine, BulkError, BulkHooks};
pub use checkpoint::CheckpointStore;
pub use handlers::{
    DeleteHandler, FlushHandler, ForwardHandler, IndexHandler, PubSubContext, PublishHandler,
    SubscribeHandler, SubscriptionRecord, UnsubscribeHandler,
};
pub use peer::{PeerConnector, PeerError, PeerForwarder, PeerLink};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, RegistryError};
pub use router::{CommandKind, Handler, Presence, Request, Router};

/// Errors surfaced to clients as error reply frames.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no {0}")]
    MissingParam(&'static str),
    #[error("connection {0} gone")]
    ConnectionGone(u64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bulk(#[from] BulkError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Wire(#[from] ripple_wire::WireError),
}

/// Milliseconds since the Unix epoch. Message records and checkpoints are
/// stamped with this clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
