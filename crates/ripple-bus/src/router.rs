//! Typed command dispatch for inbound frames.
//!
//! Commands are a closed enum and handlers are wired explicitly when the
//! node starts, so the full command surface is visible in one place.

use crate::BusError;
use crate::registry::ConnectionHandle;
use async_trait::async_trait;
use metrics::counter;
use ripple_wire::ReplyFrame;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// The full command surface of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Publish,
    Forward,
    Index,
    Delete,
    Flush,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Subscribe => "subscribe",
            CommandKind::Unsubscribe => "unsubscribe",
            CommandKind::Publish => "publish",
            CommandKind::Forward => "forward",
            CommandKind::Index => "index",
            CommandKind::Delete => "delete",
            CommandKind::Flush => "flush",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("missing handler for type: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for CommandKind {
    type Err = UnknownCommand;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "subscribe" => Ok(CommandKind::Subscribe),
            "unsubscribe" => Ok(CommandKind::Unsubscribe),
            "publish" => Ok(CommandKind::Publish),
            "forward" => Ok(CommandKind::Forward),
            "index" => Ok(CommandKind::Index),
            "delete" => Ok(CommandKind::Delete),
            "flush" => Ok(CommandKind::Flush),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// A decoded command plus typed access to its `data` parameters.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: CommandKind,
    pub data: Map<String, Value>,
}

impl Request {
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    pub fn param_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.param_str(name).unwrap_or(default)
    }

    pub fn param_u64(&self, name: &str) -> Option<u64> {
        match self.data.get(name) {
            Some(Value::Number(number)) => number.as_u64(),
            Some(Value::String(text)) => text.parse().ok(),
            _ => None,
        }
    }

    pub fn param_value(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request, conn: &ConnectionHandle) -> Result<(), BusError>;
}

/// Connection lifecycle events. Presence is not durable state; stale
/// subscription records are discovered lazily at delivery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Connected,
    Disconnected,
}

#[derive(Default)]
pub struct RouterBuilder {
    subscribe: Option<Arc<dyn Handler>>,
    unsubscribe: Option<Arc<dyn Handler>>,
    publish: Option<Arc<dyn Handler>>,
    forward: Option<Arc<dyn Handler>>,
    index: Option<Arc<dyn Handler>>,
    delete: Option<Arc<dyn Handler>>,
    flush: Option<Arc<dyn Handler>>,
}

impl RouterBuilder {
    pub fn subscribe(mut self, handler: Arc<dyn Handler>) -> Self {
        self.subscribe = Some(handler);
        self
    }

    pub fn unsubscribe(mut self, handler: Arc<dyn Handler>) -> Self {
        self.unsubscribe = Some(handler);
        self
    }

    pub fn publish(mut self, handler: Arc<dyn Handler>) -> Self {
        self.publish = Some(handler);
        self
    }

    pub fn forward(mut self, handler: Arc<dyn Handler>) -> Self {
        self.forward = Some(handler);
        self
    }

    pub fn index(mut self, handler: Arc<dyn Handler>) -> Self {
        self.index = Some(handler);
        self
    }

    pub fn delete(mut self, handler: Arc<dyn Handler>) -> Self {
        self.delete = Some(handler);
        self
    }

    pub fn flush(mut self, handler: Arc<dyn Handler>) -> Self {
        self.flush = Some(handler);
        self
    }

    pub fn build(self) -> Router {
        Router { slots: self }
    }
}

pub struct Router {
    slots: RouterBuilder,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    fn handler_for(&self, kind: CommandKind) -> Option<&Arc<dyn Handler>> {
        match kind {
            CommandKind::Subscribe => self.slots.subscribe.as_ref(),
            CommandKind::Unsubscribe => self.slots.unsubscribe.as_ref(),
            CommandKind::Publish => self.slots.publish.as_ref(),
            CommandKind::Forward => self.slots.forward.as_ref(),
            CommandKind::Index => self.slots.index.as_ref(),
            CommandKind::Delete => self.slots.delete.as_ref(),
            CommandKind::Flush => self.slots.flush.as_ref(),
        }
    }

    /// Decodes one inbound line and runs its handler. Every failure mode
    /// turns into an error reply on the connection; dispatch itself never
    /// fails.
    pub async fn dispatch_frame(&self, text: &str, conn: &ConnectionHandle) {
        let frame = match ripple_wire::decode_command(text) {
            Ok(frame) => frame,
            Err(err) => {
                counter!("frames_rejected_total").increment(1);
                let _ = conn.send(&ReplyFrame::error("error", &err.to_string()));
                return;
            }
        };
        let kind = match frame.kind.parse::<CommandKind>() {
            Ok(kind) => kind,
            Err(unknown) => {
                let _ = conn.send(&ReplyFrame::error("error", &unknown.to_string()));
                return;
            }
        };
        let Some(handler) = self.handler_for(kind) else {
            // An unwired command reads the same as an unknown one.
            let message = UnknownCommand(frame.kind).to_string();
            let _ = conn.send(&ReplyFrame::error("error", &message));
            return;
        };
        counter!("commands_total", "command" => kind.as_str()).increment(1);
        let request = Request {
            kind,
            data: frame.data,
        };
        if let Err(err) = handler.handle(request, conn).await {
            warn!(connection = %conn.id, command = kind.as_str(), error = %err, "command failed");
            let _ = conn.send(&ReplyFrame::error(kind.as_str(), &err.to_string()));
        }
    }

    pub fn on_presence(&self, presence: Presence, conn: &ConnectionHandle) {
        match presence {
            Presence::Connected => {
                info!(connection = %conn.id, remote = %conn.remote_addr, "connected");
            }
            Presence::Disconnected => {
                info!(connection = %conn.id, remote = %conn.remote_addr, "disconnected");
            }
        }
    }
}
