//! Newline-delimited JSON framing over TCP, for clients and node-to-node
//! links alike. Each accepted connection gets a registry entry, a writer
//! task draining its outbound queue, and a read loop feeding the router.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ripple_bus::registry::OUTBOUND_QUEUE_DEPTH;
use ripple_bus::{ConnectionRegistry, PeerConnector, PeerError, PeerLink, Presence, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Running accept loop plus the address it is bound to.
pub struct NodeServer {
    pub local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl NodeServer {
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Binds `addr` and starts accepting connections.
pub async fn serve(
    addr: SocketAddr,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
) -> Result<NodeServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    Ok(serve_listener(listener, router, registry)?)
}

/// Starts accepting connections on an already-bound listener.
pub fn serve_listener(
    listener: TcpListener,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
) -> Result<NodeServer> {
    let local_addr = listener.local_addr().context("read local addr")?;
    let accept_task = tokio::spawn(accept_loop(listener, router, registry));
    Ok(NodeServer {
        local_addr,
        accept_task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    router.clone(),
                    registry.clone(),
                ));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
    let handle = registry.register(peer.to_string(), tx);
    router.on_presence(Presence::Connected, &handle);
    let writer = tokio::spawn(write_loop(write_half, rx));

    read_loop(read_half, &router, &handle).await;

    router.on_presence(Presence::Disconnected, &handle);
    registry.remove(handle.id);
    writer.abort();
}

async fn read_loop(
    read_half: OwnedReadHalf,
    router: &Router,
    handle: &ripple_bus::ConnectionHandle,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                router.dispatch_frame(&line, handle).await;
            }
            Ok(None) => break,
            Err(err) => {
                debug!(connection = %handle.id, error = %err, "read failed");
                break;
            }
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

/// Dials peers over the same line framing clients use.
pub struct TcpPeerConnector;

#[async_trait]
impl PeerConnector for TcpPeerConnector {
    async fn connect(&self, addr: &str) -> std::result::Result<PeerLink, PeerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| PeerError::Connect(addr.to_string(), err.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
        tokio::spawn(write_loop(write_half, rx));
        // The peer only ever answers with error frames; log and drop them.
        let peer_addr = addr.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(peer = %peer_addr, frame = %line, "peer reply");
            }
        });
        Ok(PeerLink::new(addr, tx))
    }
}
