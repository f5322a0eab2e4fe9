//! Publish: write the message record, then fan it out to every subscriber
//! of the topic, delivering locally or forwarding to the subscriber's home
//! node. The publisher gets two replies on its connection: the message id
//! as soon as the record is written, and a delivery summary once the
//! fanout scan completes.

use super::{DEFAULT_TOPIC, PubSubContext, SUBSCRIPTION_KIND, SubscriptionRecord};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::router::{Handler, Request};
use crate::{BusError, now_millis};
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use ripple_store::ScanQuery;
use ripple_wire::{PushFrame, ReplyFrame};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PublishHandler {
    ctx: Arc<PubSubContext>,
}

impl PublishHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for PublishHandler {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        let ctx = &self.ctx;
        let topic = req.param_or("topic", DEFAULT_TOPIC).to_string();
        let payload = req.param_value("data").cloned().unwrap_or(Value::Null);
        let timestamp = req.param_u64("timestamp").unwrap_or_else(now_millis);

        let message = json!({"timestamp": timestamp, "data": payload});
        let id = ctx
            .store
            .index(&ctx.index, &topic, None, message.clone())
            .await?;
        counter!("publish_total").increment(1);
        if conn.send(&ReplyFrame::ok("publish", json!({"id": id}))).is_err() {
            debug!(connection = %conn.id, "publish ack dropped");
        }

        // Encode the push once; every local subscriber gets the same bytes.
        let push = Bytes::from(ripple_wire::to_line(&PushFrame::message(message.clone()))?);

        let query = ScanQuery::new(&ctx.index, SUBSCRIPTION_KIND)
            .term("topic", json!(topic.clone()))
            .page_size(ctx.scan_page_size)
            .keep_alive(ctx.scan_keep_alive);
        let mut scroll = match ctx.store.scan(query).await {
            Ok(scroll) => scroll,
            Err(err) => {
                warn!(%topic, error = %err, "fanout scan failed to open");
                let _ = conn.send(&ReplyFrame::ok(
                    "publish",
                    json!({"subscribers": 0, "failed": true}),
                ));
                return Ok(());
            }
        };

        let mut subscribers = 0u64;
        let mut failed = 0u64;
        let mut topic_checkpointed = false;
        loop {
            let page = match scroll.next_page().await {
                Ok(page) => page,
                Err(err) => {
                    // A degraded scan ends the fanout but still reports.
                    warn!(%topic, error = %err, "fanout scan failed");
                    failed += 1;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            // Checkpoint the topic only once a subscriber is known to
            // exist; a publish into the void leaves replay state alone.
            if !topic_checkpointed {
                ctx.checkpoints.checkpoint(&topic).await?;
                topic_checkpointed = true;
            }
            for hit in page {
                subscribers += 1;
                let record: SubscriptionRecord = match serde_json::from_value(hit.source) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(id = %hit.id, error = %err, "bad subscription record");
                        failed += 1;
                        continue;
                    }
                };
                ctx.checkpoints.checkpoint(&record.subscriber).await?;
                let target = ConnectionId(record.connection_id);
                if record.node_addr == ctx.node_addr {
                    let delivered = ctx
                        .registry
                        .get(target)
                        .map(|handle| handle.send_raw(push.clone()).is_ok())
                        .unwrap_or(false);
                    if delivered {
                        counter!("fanout_delivered_total").increment(1);
                    } else {
                        debug!(subscriber = %record.subscriber, "local subscriber gone");
                        counter!("fanout_failed_total").increment(1);
                        failed += 1;
                    }
                } else if let Err(err) = ctx
                    .peers
                    .forward(&record.node_addr, target, message.clone())
                    .await
                {
                    warn!(node = %record.node_addr, error = %err, "remote delivery failed");
                    counter!("fanout_failed_total").increment(1);
                    failed += 1;
                } else {
                    counter!("fanout_delivered_total").increment(1);
                }
            }
        }

        if topic_checkpointed {
            ctx.checkpoints.flush().await?;
        }
        let _ = conn.send(&ReplyFrame::ok(
            "publish",
            json!({"subscribers": subscribers, "failed": failed}),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{BulkConfig, BulkEngine};
    use crate::checkpoint::{CHECKPOINT_KIND, CheckpointStore};
    use crate::handlers::testutil::{RecordingConnector, client, next_frame, request, test_bus};
    use crate::peer::PeerForwarder;
    use crate::registry::ConnectionRegistry;
    use crate::router::CommandKind;
    use ripple_store::{
        BulkSummary, DocPath, DocStore, MemoryStore, Scroll, StoreError, WriteOp,
    };
    use std::time::Duration;

    async fn insert_subscription(
        bus: &crate::handlers::testutil::TestBus,
        record: &SubscriptionRecord,
    ) {
        bus.store
            .index(
                "pubsub",
                SUBSCRIPTION_KIND,
                Some(record.subscriber.clone()),
                serde_json::to_value(record).expect("record"),
            )
            .await
            .expect("index");
    }

    #[tokio::test]
    async fn publish_delivers_to_local_subscriber() {
        let bus = test_bus();
        let (sub_conn, mut sub_rx) = client(&bus.ctx);
        insert_subscription(
            &bus,
            &SubscriptionRecord {
                topic: "alerts".into(),
                subscriber: "s1".into(),
                connection_id: sub_conn.id.0,
                node_addr: bus.ctx.node_addr.clone(),
                remote_addr: sub_conn.remote_addr.clone(),
            },
        )
        .await;

        let (pub_conn, mut pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(
                    CommandKind::Publish,
                    json!({"topic": "alerts", "data": {"n": 1}}),
                ),
                &pub_conn,
            )
            .await
            .expect("publish");

        let ack = next_frame(&mut pub_rx).await;
        assert_eq!(ack["ok"], true);
        assert!(ack["data"]["id"].is_string());

        let summary = next_frame(&mut pub_rx).await;
        assert_eq!(summary["data"]["subscribers"], 1);
        assert_eq!(summary["data"]["failed"], 0);

        let push = next_frame(&mut sub_rx).await;
        assert_eq!(push["type"], "message");
        assert_eq!(push["data"]["data"]["n"], 1);
        assert!(push["data"]["timestamp"].is_u64());
    }

    #[tokio::test]
    async fn publish_forwards_to_remote_subscriber() {
        let bus = test_bus();
        insert_subscription(
            &bus,
            &SubscriptionRecord {
                topic: "alerts".into(),
                subscriber: "far".into(),
                connection_id: 42,
                node_addr: "10.0.0.9:7420".into(),
                remote_addr: "10.9.9.9:1234".into(),
            },
        )
        .await;

        let (pub_conn, mut pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(
                    CommandKind::Publish,
                    json!({"topic": "alerts", "data": "hi"}),
                ),
                &pub_conn,
            )
            .await
            .expect("publish");

        let _ack = next_frame(&mut pub_rx).await;
        let summary = next_frame(&mut pub_rx).await;
        assert_eq!(summary["data"]["subscribers"], 1);
        assert_eq!(summary["data"]["failed"], 0);

        // The recording connector drains links asynchronously.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if !bus.peer_frames.lock().expect("lock").is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("forward frame");
        let frames = bus.peer_frames.lock().expect("lock").clone();
        let (addr, frame) = &frames[0];
        assert_eq!(addr, "10.0.0.9:7420");
        assert_eq!(frame["type"], "forward");
        assert_eq!(frame["data"]["channel"], 42);
        assert_eq!(frame["data"]["message"]["data"], "hi");
    }

    #[tokio::test]
    async fn client_supplied_timestamp_is_kept() {
        let bus = test_bus();
        let (pub_conn, mut pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(
                    CommandKind::Publish,
                    json!({"topic": "alerts", "timestamp": 12345, "data": "x"}),
                ),
                &pub_conn,
            )
            .await
            .expect("publish");

        let ack = next_frame(&mut pub_rx).await;
        let id = ack["data"]["id"].as_str().expect("id").to_string();
        let record = bus
            .store
            .get(&DocPath::new("pubsub", "alerts", id))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record["timestamp"], 12345);
    }

    #[tokio::test]
    async fn gone_local_subscriber_counts_failed() {
        let bus = test_bus();
        insert_subscription(
            &bus,
            &SubscriptionRecord {
                topic: "alerts".into(),
                subscriber: "ghost".into(),
                connection_id: 999,
                node_addr: bus.ctx.node_addr.clone(),
                remote_addr: "gone".into(),
            },
        )
        .await;

        let (pub_conn, mut pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(CommandKind::Publish, json!({"topic": "alerts", "data": 1})),
                &pub_conn,
            )
            .await
            .expect("publish");

        let _ack = next_frame(&mut pub_rx).await;
        let summary = next_frame(&mut pub_rx).await;
        assert_eq!(summary["data"]["subscribers"], 1);
        assert_eq!(summary["data"]["failed"], 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_still_writes_and_replies() {
        let bus = test_bus();
        let (pub_conn, mut pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(CommandKind::Publish, json!({"data": {"n": 1}})),
                &pub_conn,
            )
            .await
            .expect("publish");

        let ack = next_frame(&mut pub_rx).await;
        let id = ack["data"]["id"].as_str().expect("id").to_string();
        let summary = next_frame(&mut pub_rx).await;
        assert_eq!(summary["data"]["subscribers"], 0);

        // Default topic and message record present.
        let record = bus
            .store
            .get(&DocPath::new("pubsub", DEFAULT_TOPIC, id))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record["data"]["n"], 1);

        // No subscribers, so the topic checkpoint did not advance.
        let checkpoint = bus
            .store
            .get(&DocPath::new("pubsub", CHECKPOINT_KIND, DEFAULT_TOPIC))
            .await
            .expect("get");
        assert_eq!(checkpoint, None);
    }

    #[tokio::test]
    async fn publish_flushes_checkpoints_for_topic_and_subscribers() {
        let bus = test_bus();
        let (sub_conn, _sub_rx) = client(&bus.ctx);
        insert_subscription(
            &bus,
            &SubscriptionRecord {
                topic: "alerts".into(),
                subscriber: "s1".into(),
                connection_id: sub_conn.id.0,
                node_addr: bus.ctx.node_addr.clone(),
                remote_addr: sub_conn.remote_addr.clone(),
            },
        )
        .await;

        let (pub_conn, _pub_rx) = client(&bus.ctx);
        PublishHandler::new(bus.ctx.clone())
            .handle(
                request(CommandKind::Publish, json!({"topic": "alerts", "data": 1})),
                &pub_conn,
            )
            .await
            .expect("publish");

        for key in ["alerts", "s1"] {
            let stamped = bus
                .store
                .get(&DocPath::new("pubsub", CHECKPOINT_KIND, key))
                .await
                .expect("get");
            assert!(stamped.is_some(), "checkpoint for {key}");
        }
    }

    struct ScanlessStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocStore for ScanlessStore {
        async fn index(
            &self,
            index: &str,
            kind: &str,
            id: Option<String>,
            source: Value,
        ) -> ripple_store::Result<String> {
            self.inner.index(index, kind, id, source).await
        }

        async fn get(&self, path: &DocPath) -> ripple_store::Result<Option<Value>> {
            self.inner.get(path).await
        }

        async fn delete(&self, path: &DocPath) -> ripple_store::Result<bool> {
            self.inner.delete(path).await
        }

        async fn bulk(&self, ops: Vec<WriteOp>) -> ripple_store::Result<BulkSummary> {
            self.inner.bulk(ops).await
        }

        async fn scan(&self, _query: ScanQuery) -> ripple_store::Result<Scroll> {
            Err(StoreError::Backend("scan refused".into()))
        }
    }

    #[tokio::test]
    async fn failed_scan_replies_failed_true_and_stops() {
        let store = Arc::new(ScanlessStore {
            inner: MemoryStore::new(),
        });
        let bulk = BulkEngine::new(
            store.clone(),
            BulkConfig {
                max_concurrent_flushes: 0,
                max_buffered_ops: -1,
                flush_interval: None,
            },
        );
        let checkpoints = CheckpointStore::new(store.clone(), bulk.clone(), "pubsub");
        let ctx = Arc::new(PubSubContext {
            store: store.clone(),
            bulk,
            checkpoints,
            registry: Arc::new(ConnectionRegistry::new()),
            peers: Arc::new(PeerForwarder::new(Arc::new(RecordingConnector::new()))),
            node_addr: "127.0.0.1:7420".into(),
            index: "pubsub".into(),
            scan_page_size: 100,
            scan_keep_alive: Duration::from_secs(60),
        });

        let (pub_conn, mut pub_rx) = client(&ctx);
        PublishHandler::new(ctx.clone())
            .handle(
                request(CommandKind::Publish, json!({"topic": "alerts", "data": 1})),
                &pub_conn,
            )
            .await
            .expect("publish");

        let ack = next_frame(&mut pub_rx).await;
        assert_eq!(ack["ok"], true);
        let summary = next_frame(&mut pub_rx).await;
        assert_eq!(summary["data"]["subscribers"], 0);
        assert_eq!(summary["data"]["failed"], true);

        let checkpoint = store
            .get(&DocPath::new("pubsub", CHECKPOINT_KIND, "alerts"))
            .await
            .expect("get");
        assert_eq!(checkpoint, None, "topic checkpoint untouched");
    }
}
