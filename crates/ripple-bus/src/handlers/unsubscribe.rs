//! Unsubscribe: delete the durable subscription record. Live connections
//! are untouched; the subscriber just stops appearing in fanout scans.

use super::{PubSubContext, SUBSCRIPTION_KIND};
use crate::BusError;
use crate::registry::ConnectionHandle;
use crate::router::{Handler, Request};
use async_trait::async_trait;
use metrics::counter;
use ripple_store::DocPath;
use ripple_wire::ReplyFrame;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub struct UnsubscribeHandler {
    ctx: Arc<PubSubContext>,
}

impl UnsubscribeHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for UnsubscribeHandler {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        let subscriber = req
            .param_str("subscriber")
            .ok_or(BusError::MissingParam("subscriber"))?;
        // The record is keyed by subscriber alone, so no topic is needed
        // to address it.
        let path = DocPath::new(self.ctx.index.clone(), SUBSCRIPTION_KIND, subscriber);
        let existed = self.ctx.store.delete(&path).await?;
        if !existed {
            debug!(subscriber, "no subscription record to remove");
        }
        counter!("unsubscribe_total").increment(1);
        let _ = conn.send(&ReplyFrame::ok("unsubscribe", json!({"id": subscriber})));
        Ok(())
    }
}
