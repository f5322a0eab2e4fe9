//! Forward: terminal hop of a cross-node delivery. Another node resolved a
//! subscription to a connection living here and hands us the prebuilt
//! message; we push it to that connection or tell the forwarding node the
//! connection is gone.

use super::PubSubContext;
use crate::BusError;
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::router::{Handler, Request};
use async_trait::async_trait;
use metrics::counter;
use ripple_wire::PushFrame;
use serde_json::Value;
use std::sync::Arc;

pub struct ForwardHandler {
    ctx: Arc<PubSubContext>,
}

impl ForwardHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, req: Request, _conn: &ConnectionHandle) -> Result<(), BusError> {
        let channel = req
            .param_u64("channel")
            .ok_or(BusError::MissingParam("channel"))?;
        let message = req.param_value("message").cloned().unwrap_or(Value::Null);
        let target = self
            .ctx
            .registry
            .get(ConnectionId(channel))
            .ok_or(BusError::ConnectionGone(channel))?;
        target
            .send(&PushFrame::message(message))
            .map_err(|_| BusError::ConnectionGone(channel))?;
        counter!("forward_delivered_total").increment(1);
        Ok(())
    }
}
