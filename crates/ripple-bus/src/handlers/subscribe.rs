//! Subscribe: upsert the durable subscription record, acknowledge, then
//! replay messages the subscriber missed since its last checkpoint.
//!
//! Replay is at most once: the subscriber's checkpoint advances before any
//! message is pushed, so a crash mid-replay loses the remainder instead of
//! repeating it.

use super::{DEFAULT_TOPIC, PubSubContext, SUBSCRIPTION_KIND, SubscriptionRecord};
use crate::registry::ConnectionHandle;
use crate::router::{Handler, Request};
use crate::BusError;
use async_trait::async_trait;
use metrics::counter;
use ripple_store::{ScanQuery, StoreError};
use ripple_wire::{PushFrame, ReplyFrame};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SubscribeHandler {
    ctx: Arc<PubSubContext>,
}

impl SubscribeHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for SubscribeHandler {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        let ctx = &self.ctx;
        let subscriber = req
            .param_str("subscriber")
            .ok_or(BusError::MissingParam("subscriber"))?
            .to_string();
        let topic = req.param_or("topic", DEFAULT_TOPIC).to_string();

        let record = SubscriptionRecord {
            topic: topic.clone(),
            subscriber: subscriber.clone(),
            connection_id: conn.id.0,
            node_addr: ctx.node_addr.clone(),
            remote_addr: conn.remote_addr.clone(),
        };
        // Keyed by subscriber alone: re-subscribing under a new topic
        // replaces the old binding instead of adding a second one.
        ctx.store
            .index(
                &ctx.index,
                SUBSCRIPTION_KIND,
                Some(subscriber.clone()),
                serde_json::to_value(&record).map_err(StoreError::from)?,
            )
            .await?;
        counter!("subscribe_total").increment(1);
        let _ = conn.send(&ReplyFrame::ok("subscribe", json!({"id": subscriber.clone()})));

        // Catch-up runs off the request path; the ack never waits on replay.
        let ctx = self.ctx.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(err) = catch_up(&ctx, &topic, &subscriber, &conn).await {
                warn!(%topic, %subscriber, error = %err, "catch-up sync failed");
            }
        });
        Ok(())
    }
}

async fn catch_up(
    ctx: &PubSubContext,
    topic: &str,
    subscriber: &str,
    conn: &ConnectionHandle,
) -> Result<(), BusError> {
    let last_seen = ctx.checkpoints.checkpointed_at(subscriber).await?;
    let topic_seen = ctx.checkpoints.checkpointed_at(topic).await?;
    let (Some(last_seen), Some(topic_seen)) = (last_seen, topic_seen) else {
        return Ok(());
    };
    if last_seen >= topic_seen {
        return Ok(());
    }

    // Advance the cursor first, then replay.
    ctx.checkpoints.checkpoint(subscriber).await?;
    ctx.checkpoints.flush().await?;

    let query = ScanQuery::new(&ctx.index, topic)
        .min_timestamp(last_seen)
        .page_size(ctx.scan_page_size)
        .keep_alive(ctx.scan_keep_alive);
    let mut scroll = ctx.store.scan(query).await?;
    let mut replayed = 0u64;
    loop {
        let page = scroll.next_page().await?;
        if page.is_empty() {
            break;
        }
        for hit in page {
            if conn.send(&PushFrame::message(hit.source)).is_err() {
                debug!(connection = %conn.id, "subscriber gone during replay");
                return Ok(());
            }
            replayed += 1;
        }
    }
    counter!("replayed_total").increment(replayed);
    debug!(topic, subscriber, replayed, "catch-up complete");
    Ok(())
}
