//! Raw document commands on the client wire: `index` and `delete` enqueue
//! on the bulk engine with the requesting connection as the reply target,
//! `flush` forces the buffered batch out.

use super::PubSubContext;
use crate::BusError;
use crate::registry::ConnectionHandle;
use crate::router::{Handler, Request};
use async_trait::async_trait;
use ripple_store::WriteOp;
use ripple_wire::ReplyFrame;
use serde_json::json;
use std::sync::Arc;

pub struct IndexHandler {
    ctx: Arc<PubSubContext>,
}

impl IndexHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for IndexHandler {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        let index = req
            .param_str("index")
            .ok_or(BusError::MissingParam("index"))?
            .to_string();
        let kind = req
            .param_str("type")
            .ok_or(BusError::MissingParam("type"))?
            .to_string();
        let id = req.param_str("id").map(str::to_string);
        let source = req
            .param_value("data")
            .cloned()
            .ok_or(BusError::MissingParam("data"))?;
        self.ctx
            .bulk
            .add_with_reply(
                WriteOp::Index {
                    index,
                    kind,
                    id,
                    source,
                },
                conn.clone(),
            )
            .await?;
        Ok(())
    }
}

pub struct DeleteHandler {
    ctx: Arc<PubSubContext>,
}

impl DeleteHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for DeleteHandler {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        let index = req
            .param_str("index")
            .ok_or(BusError::MissingParam("index"))?
            .to_string();
        let kind = req
            .param_str("type")
            .ok_or(BusError::MissingParam("type"))?
            .to_string();
        let id = req
            .param_str("id")
            .ok_or(BusError::MissingParam("id"))?
            .to_string();
        self.ctx
            .bulk
            .add_with_reply(WriteOp::Delete { index, kind, id }, conn.clone())
            .await?;
        Ok(())
    }
}

pub struct FlushHandler {
    ctx: Arc<PubSubContext>,
}

impl FlushHandler {
    pub fn new(ctx: Arc<PubSubContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for FlushHandler {
    async fn handle(&self, _req: Request, conn: &ConnectionHandle) -> Result<(), BusError> {
        self.ctx.bulk.flush().await?;
        let _ = conn.send(&ReplyFrame::ok("flush", json!({"flushed": true})));
        Ok(())
    }
}
