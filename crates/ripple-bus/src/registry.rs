//! Node-local registry of live client connections.

use bytes::Bytes;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// How many outbound frames may queue per connection before sends drop.
pub const OUTBOUND_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} unreachable")]
    Unreachable(ConnectionId),
    #[error("frame encode failed")]
    Encode,
}

/// Stable node-local connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloneable sending half of a client connection. The transport owns the
/// socket and drains the channel from a writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub remote_addr: String,
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, remote_addr: impl Into<String>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            remote_addr: remote_addr.into(),
            tx,
        }
    }

    /// Encodes a frame and enqueues it. A full or closed outbound queue
    /// drops the frame and reports the connection unreachable.
    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), RegistryError> {
        let line = ripple_wire::to_line(frame).map_err(|_| RegistryError::Encode)?;
        self.send_raw(Bytes::from(line))
    }

    /// Enqueues an already-encoded frame. Fanout paths encode once and
    /// clone the bytes per subscriber.
    pub fn send_raw(&self, frame: Bytes) -> Result<(), RegistryError> {
        self.tx.try_send(frame).map_err(|_| {
            counter!("outbound_dropped_total").increment(1);
            RegistryError::Unreachable(self.id)
        })
    }
}

/// Registry of live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id, registers a handle around `tx`, and returns it.
    pub fn register(&self, remote_addr: impl Into<String>, tx: mpsc::Sender<Bytes>) -> ConnectionHandle {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = ConnectionHandle::new(id, remote_addr, tx);
        self.connections.write().insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.write().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_wire::ReplyFrame;
    use serde_json::json;

    fn channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn register_allocates_monotonic_ids() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let first = registry.register("127.0.0.1:1000", tx.clone());
        let second = registry.register("127.0.0.1:1001", tx);
        assert_eq!(first.id, ConnectionId(1));
        assert_eq!(second.id, ConnectionId(2));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn send_delivers_encoded_frame() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let handle = registry.register("127.0.0.1:1000", tx);
        handle
            .send(&ReplyFrame::ok("publish", json!({"id": "1"})))
            .expect("send");
        let frame = rx.recv().await.expect("frame");
        assert_eq!(frame, r#"{"ok":true,"type":"publish","data":{"id":"1"}}"#);
    }

    #[tokio::test]
    async fn remove_forgets_the_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.register("127.0.0.1:1000", tx);
        assert!(registry.remove(handle.id).is_some());
        assert!(registry.get(handle.id).is_none());
        assert!(registry.remove(handle.id).is_none());
    }

    #[tokio::test]
    async fn full_queue_reports_unreachable() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(ConnectionId(9), "peer", tx);
        handle.send_raw(Bytes::from_static(b"a")).expect("first");
        let err = handle.send_raw(Bytes::from_static(b"b"));
        assert!(matches!(err, Err(RegistryError::Unreachable(ConnectionId(9)))));
    }

    #[tokio::test]
    async fn closed_queue_reports_unreachable() {
        let (tx, rx) = channel();
        drop(rx);
        let handle = ConnectionHandle::new(ConnectionId(3), "peer", tx);
        assert!(handle.send_raw(Bytes::from_static(b"x")).is_err());
    }
}
