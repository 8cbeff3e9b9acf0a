//! WebSocket protocol - JSON-RPC style requests plus pushed events
//!
//! Wire format:
//!
//! Client → Server (RPC request):
//!   { "id": "req-1", "method": "chat.send", "params": { "chat": "laptop", "message": "Hello" } }
//!
//! Server → Client (RPC response):
//!   { "id": "req-1", "result": { "ok": true } }
//!   { "id": "req-1", "error": { "code": -32001, "message": "session not found: ws:laptop:x" } }
//!
//! Server → Client (event push, no id):
//!   { "event": "chat", "data": { "chat": "laptop", "type": "tool_call", "name": "session_manage", ... } }
//!
//! Authentication shorthand:
//!   { "token": "secret" }

use crate::message::Outbound;
use serde::{Deserialize, Serialize};

pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INTERNAL: i32 = -32603;
pub const CODE_AUTH: i32 = -32000;
pub const CODE_NOT_FOUND: i32 = -32001;
pub const CODE_CONFLICT: i32 = -32002;

/// RPC request from client.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// RPC response to client.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<&crate::Error> for RpcError {
    fn from(e: &crate::Error) -> Self {
        let code = match e {
            crate::Error::SessionNotFound(_) | crate::Error::UnknownTool(_) => CODE_NOT_FOUND,
            crate::Error::DuplicateName(_) => CODE_CONFLICT,
            crate::Error::InvalidArguments { .. } => CODE_INVALID_PARAMS,
            crate::Error::AuthFailed(_) => CODE_AUTH,
            _ => CODE_INTERNAL,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

/// Server-pushed event (no id, no request correlation).
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// A chat event scoped to one chat id.
    pub fn chat(chat: &str, event_type: &str, data: serde_json::Value) -> Self {
        let mut map = serde_json::Map::new();
        map.insert("chat".into(), serde_json::Value::String(chat.to_string()));
        map.insert(
            "type".into(),
            serde_json::Value::String(event_type.to_string()),
        );
        for (k, v) in data.as_object().cloned().unwrap_or_default() {
            map.insert(k, v);
        }
        Self::new("chat", serde_json::Value::Object(map))
    }

    /// Render an outbound delivery for the wire.
    pub fn from_outbound(outbound: &Outbound) -> Self {
        match outbound {
            Outbound::Message(m) => Self::chat(
                &m.identity.chat_id,
                "message",
                serde_json::json!({
                    "text": m.text,
                    "media": m.media,
                    "title": m.title,
                }),
            ),
            Outbound::ToolCall(n) => Self::chat(
                &n.identity.chat_id,
                "tool_call",
                serde_json::json!({
                    "session": n.session.as_str(),
                    "id": n.call_id,
                    "name": n.name,
                    "summary": n.summary,
                }),
            ),
        }
    }

    pub fn chat_done(chat: &str, session: &str, reason: &str) -> Self {
        Self::chat(
            chat,
            "done",
            serde_json::json!({ "session": session, "reason": reason }),
        )
    }

    pub fn chat_error(chat: &str, message: &str) -> Self {
        Self::chat(chat, "error", serde_json::json!({ "message": message }))
    }

    pub fn auth_result(ok: bool, error: Option<&str>) -> Self {
        Self::new("auth", serde_json::json!({ "ok": ok, "error": error }))
    }

    /// Sent on connection.
    pub fn info(version: &str) -> Self {
        Self::new("info", serde_json::json!({ "version": version }))
    }

    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }
}

/// Unified incoming message. Serde tries RPC first, then the auth shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Rpc(RpcRequest),
    Auth { token: Option<String> },
}
