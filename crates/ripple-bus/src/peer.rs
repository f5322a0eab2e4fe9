//! Outbound links to other nodes.
//!
//! A message published here but subscribed from another node is handed to
//! that node as a `forward` command over a lazily-dialed, cached link. A
//! failed send evicts the link; the next forward re-dials. There is no
//! retry or reconnect loop.

use crate::registry::ConnectionId;
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("peer {0} unreachable")]
    Unreachable(String),
    #[error("frame encode failed")]
    Encode,
}

/// Sending half of one outbound node connection. The connector owns the
/// socket and drains the channel from a writer task.
#[derive(Debug, Clone)]
pub struct PeerLink {
    addr: String,
    tx: mpsc::Sender<Bytes>,
}

impl PeerLink {
    pub fn new(addr: impl Into<String>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            addr: addr.into(),
            tx,
        }
    }

    fn send(&self, frame: Bytes) -> Result<(), PeerError> {
        self.tx
            .try_send(frame)
            .map_err(|_| PeerError::Unreachable(self.addr.clone()))
    }
}

/// Dials a node address the same way a client connects.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<PeerLink, PeerError>;
}

type LinkSlot = Arc<Mutex<Option<PeerLink>>>;

pub struct PeerForwarder {
    connector: Arc<dyn PeerConnector>,
    // One slot per node address, locked individually so connect-if-absent
    // is atomic per address. A dial in progress to one peer never holds
    // up forwards to the others; the outer map lock is only held long
    // enough to fetch or insert a slot.
    links: Mutex<HashMap<String, LinkSlot>>,
}

impl PeerForwarder {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Hands a message to `node_addr` for local delivery to the `channel`
    /// connection there. On failure the cached link is evicted and the
    /// error returned.
    pub async fn forward(
        &self,
        node_addr: &str,
        channel: ConnectionId,
        message: Value,
    ) -> Result<(), PeerError> {
        let frame = json!({
            "type": "forward",
            "data": {"channel": channel.0, "message": message},
        });
        let line = ripple_wire::to_line(&frame).map_err(|_| PeerError::Encode)?;

        let slot = {
            let mut links = self.links.lock().await;
            match links.entry(node_addr.to_string()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(vacant) => vacant.insert(Arc::new(Mutex::new(None))).clone(),
            }
        };
        let mut link = slot.lock().await;
        let active = match link.clone() {
            Some(active) => active,
            None => {
                debug!(node = node_addr, "dialing peer");
                counter!("peer_dialed_total").increment(1);
                let dialed = self.connector.connect(node_addr).await?;
                *link = Some(dialed.clone());
                dialed
            }
        };
        if let Err(err) = active.send(Bytes::from(line)) {
            warn!(node = node_addr, error = %err, "peer send failed, evicting link");
            counter!("peer_evicted_total").increment(1);
            *link = None;
            return Err(err);
        }
        Ok(())
    }

    pub async fn cached_links(&self) -> usize {
        let links = self.links.lock().await;
        let mut live = 0;
        for slot in links.values() {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }
}
