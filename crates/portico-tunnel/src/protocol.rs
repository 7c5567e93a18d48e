//! Tunnel wire frames exchanged with the relay over the WebSocket

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON text frame, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    /// Relay accepted the tunnel
    Connected { tunnel_id: String, public_url: String },
    /// A public request to forward to the local gateway
    Request {
        request_id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_params: Option<BTreeMap<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    /// Buffered answer to a regular request
    Response {
        request_id: String,
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: String,
    },
    StreamChunk { request_id: String, body: String },
    StreamEnd { request_id: String },
    StreamCancel { request_id: String },
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
    Pong { timestamp: Value },
    Error { message: String },
    /// Any frame type this client does not understand
    #[serde(other)]
    Unknown,
}

impl TunnelFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::StreamChunk { request_id, .. }
            | Self::StreamEnd { request_id }
            | Self::StreamCancel { request_id } => Some(request_id),
            _ => None,
        }
    }
}

/// Render a header or query value the relay sent. Multi-valued entries
/// arrive as arrays and are joined the way HTTP folds repeated headers.
pub fn flatten_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(flatten_value).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        other => Some(other.to_string()),
    }
}

/// Request body bytes: strings pass through, anything else is re-encoded as JSON
pub fn body_bytes(body: &Option<Value>) -> Option<Vec<u8>> {
    match body {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone().into_bytes()),
        Some(other) => Some(other.to_string().into_bytes()),
    }
}
