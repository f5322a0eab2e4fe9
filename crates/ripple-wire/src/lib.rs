//! JSON frame envelope for the ripple message bus.
//!
//! Every frame on the wire is a single JSON object on its own line. Inbound
//! frames are commands (`{"type": ..., "data": {...}}`); outbound frames are
//! either replies correlated by ordering on the connection
//! (`{"ok": true/false, ...}`) or unsolicited pushes (`{"type": "message", ...}`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid request")]
    InvalidFrame,
    #[error("no type found")]
    MissingType,
    #[error("serialize: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Inbound command frame.
///
/// ```
/// let frame = ripple_wire::decode_command(r#"{"type":"publish","data":{"topic":"t"}}"#)
///     .expect("decode");
/// assert_eq!(frame.kind, "publish");
/// assert_eq!(frame.data["topic"], "t");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub kind: String,
    pub data: Map<String, Value>,
}

/// Parses an inbound line into a command frame.
///
/// Anything that is not a JSON object is `WireError::InvalidFrame`; an object
/// without a string `type` field is `WireError::MissingType`. A missing
/// `data` field decodes as an empty map.
pub fn decode_command(text: &str) -> Result<CommandFrame> {
    let value: Value = serde_json::from_str(text).map_err(|_| WireError::InvalidFrame)?;
    let Value::Object(mut object) = value else {
        return Err(WireError::InvalidFrame);
    };
    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(WireError::MissingType),
    };
    let data = match object.remove("data") {
        Some(Value::Object(data)) => data,
        _ => Map::new(),
    };
    Ok(CommandFrame { kind, data })
}

/// Outbound reply frame, success or error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyFrame {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyFrame {
    pub fn ok(kind: &str, data: Value) -> Self {
        Self {
            ok: true,
            kind: kind.to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(kind: &str, message: &str) -> Self {
        Self {
            ok: false,
            kind: kind.to_string(),
            data: None,
            error: Some(message.to_string()),
        }
    }
}

/// Outbound push frame carrying a published message to a subscriber.
///
/// ```
/// use ripple_wire::PushFrame;
/// use serde_json::json;
///
/// let line = ripple_wire::to_line(&PushFrame::message(json!({"n": 1}))).expect("encode");
/// assert_eq!(line, r#"{"type":"message","data":{"n":1}}"#);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl PushFrame {
    pub fn message(data: Value) -> Self {
        Self {
            kind: "message".to_string(),
            data,
        }
    }
}

/// Encodes a frame as a single JSON line, without the trailing newline.
pub fn to_line<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(WireError::Serialize)
}
