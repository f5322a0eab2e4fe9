//! Composition root: builds the bulk engine, checkpoints, registry, peer
//! forwarder, and router from a `NodeConfig` and a document store.

use crate::config::NodeConfig;
use ripple_bus::{
    BulkConfig, BulkEngine, CheckpointStore, ConnectionRegistry, DeleteHandler, FlushHandler,
    ForwardHandler, IndexHandler, PeerConnector, PeerForwarder, PubSubContext, PublishHandler,
    Router, SubscribeHandler, UnsubscribeHandler,
};
use ripple_store::DocStore;
use std::sync::Arc;
use std::time::Duration;

pub struct Node {
    pub router: Arc<Router>,
    pub registry: Arc<ConnectionRegistry>,
    pub bulk: BulkEngine,
    pub ctx: Arc<PubSubContext>,
}

pub fn build_node(
    config: &NodeConfig,
    store: Arc<dyn DocStore>,
    connector: Arc<dyn PeerConnector>,
) -> Node {
    let bulk = BulkEngine::new(
        store.clone(),
        BulkConfig {
            max_concurrent_flushes: config.bulk_max_concurrent_flushes,
            max_buffered_ops: config.bulk_max_buffered_ops,
            flush_interval: (config.bulk_flush_interval_ms > 0)
                .then(|| Duration::from_millis(config.bulk_flush_interval_ms)),
        },
    );
    let checkpoints = CheckpointStore::new(store.clone(), bulk.clone(), &config.pubsub_index);
    let registry = Arc::new(ConnectionRegistry::new());
    let peers = Arc::new(PeerForwarder::new(connector));
    let ctx = Arc::new(PubSubContext {
        store,
        bulk: bulk.clone(),
        checkpoints,
        registry: registry.clone(),
        peers,
        node_addr: config.advertise_addr.clone(),
        index: config.pubsub_index.clone(),
        scan_page_size: config.scan_page_size,
        scan_keep_alive: Duration::from_millis(config.scan_keep_alive_ms),
    });
    // The command surface is wired explicitly; anything not listed here
    // answers "missing handler".
    let router = Arc::new(
        Router::builder()
            .subscribe(Arc::new(SubscribeHandler::new(ctx.clone())))
            .unsubscribe(Arc::new(UnsubscribeHandler::new(ctx.clone())))
            .publish(Arc::new(PublishHandler::new(ctx.clone())))
            .forward(Arc::new(ForwardHandler::new(ctx.clone())))
            .index(Arc::new(IndexHandler::new(ctx.clone())))
            .delete(Arc::new(DeleteHandler::new(ctx.clone())))
            .flush(Arc::new(FlushHandler::new(ctx.clone())))
            .build(),
    );
    Node {
        router,
        registry,
        bulk,
        ctx,
    }
}
