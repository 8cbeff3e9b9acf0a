//! RPC router - dispatches JSON-RPC method calls to handlers
//!
//! Every chat-scoped method takes a `chat` param naming the WebSocket chat id;
//! the conversation identity is then `ws:<chat>`. Agent output for a chat is
//! pushed as `chat` events on the shared broadcast channel.

use nanoclaw_agent::MessageBus;
use nanoclaw_core::protocol::{
    EventMessage, RpcError, RpcResponse, CODE_AUTH, CODE_INVALID_PARAMS, CODE_METHOD_NOT_FOUND,
    CODE_NOT_FOUND,
};
use nanoclaw_core::{ChannelIdentity, Error, InboundMessage, NewSession, SessionKey};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Channel name used for WebSocket identities.
pub const WS_CHANNEL: &str = "ws";

/// Connection context passed to RPC handlers.
pub struct ConnectionContext {
    pub authenticated: bool,
    pub bus: Arc<MessageBus>,
    pub events: broadcast::Sender<EventMessage>,
}

/// Result type for RPC handlers.
pub type RpcResult = Result<Value, (i32, String)>;

/// Route an RPC method call to the appropriate handler.
pub async fn route_rpc(method: &str, params: Value, ctx: &ConnectionContext) -> RpcResult {
    if !ctx.authenticated {
        return Err((CODE_AUTH, "Not authenticated".to_string()));
    }

    match method {
        "chat.send" => handle_chat_send(params, ctx).await,
        "chat.history" => handle_chat_history(params, ctx).await,
        "chat.abort" => handle_chat_abort(params, ctx),
        "sessions.list" => handle_sessions_list(params, ctx).await,
        "sessions.create" => handle_sessions_create(params, ctx).await,
        "sessions.switch" => handle_sessions_switch(params, ctx).await,
        "sessions.reset" => handle_sessions_reset(params, ctx).await,
        "sessions.current" => handle_sessions_current(params, ctx).await,
        "sessions.delete" => handle_sessions_delete(params, ctx).await,
        "tools.list" => handle_tools_list(ctx),
        "health" => handle_health(ctx),
        _ => Err((CODE_METHOD_NOT_FOUND, format!("Method not found: {}", method))),
    }
}

/// Convert an RPC result to an RpcResponse.
pub fn to_response(id: &str, result: RpcResult) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err((code, message)) => RpcResponse::err(id, code, message),
    }
}

fn rpc_error(e: Error) -> (i32, String) {
    let e = RpcError::from(&e);
    (e.code, e.message)
}

fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, (i32, String)> {
    params[name]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| (CODE_INVALID_PARAMS, format!("Missing required param: {}", name)))
}

fn optional_str(params: &Value, name: &str) -> Option<String> {
    params[name]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn identity(params: &Value) -> Result<ChannelIdentity, (i32, String)> {
    Ok(ChannelIdentity::new(WS_CHANNEL, require_str(params, "chat")?))
}

// ---------------------------------------------------------------------------
// chat.send - run a message through the chat's active session
// ---------------------------------------------------------------------------

async fn handle_chat_send(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let message = require_str(&params, "message")?.to_string();
    let session = ctx
        .bus
        .runtime()
        .sessions()
        .resolve_active_key(&identity)
        .await
        .map_err(rpc_error)?;

    info!(
        "chat.send: chat={} session={} message={}",
        identity.chat_id,
        session,
        message.chars().take(50).collect::<String>()
    );

    // Output reaches clients through the ws channel adapter; only completion is reported here.
    let bus = ctx.bus.clone();
    let events = ctx.events.clone();
    tokio::spawn(async move {
        let chat = identity.chat_id.clone();
        let event = match bus.handle(InboundMessage::new(identity, message)).await {
            Ok(dispatched) => EventMessage::chat_done(
                &chat,
                dispatched.outcome.session.as_str(),
                dispatched.outcome.reason.as_str(),
            ),
            Err(e) => {
                warn!(chat = %chat, "chat turn failed: {}", e);
                EventMessage::chat_error(&chat, &e.to_string())
            }
        };
        let _ = events.send(event);
    });

    Ok(serde_json::json!({ "ok": true, "session": session.as_str() }))
}

// ---------------------------------------------------------------------------
// chat.history - transcript of the active (or a named, owned) session
// ---------------------------------------------------------------------------

async fn handle_chat_history(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let store = ctx.bus.runtime().sessions();
    let key = match optional_str(&params, "session") {
        Some(raw) => {
            let key = SessionKey::new(raw);
            if !identity.owns(&key) {
                return Err((CODE_NOT_FOUND, Error::session_not_found(key).to_string()));
            }
            key
        }
        None => store.resolve_active_key(&identity).await.map_err(rpc_error)?,
    };
    let turns = store.transcript(&key).await.map_err(rpc_error)?;
    Ok(serde_json::json!({
        "session": key.as_str(),
        "turns": turns,
    }))
}

// ---------------------------------------------------------------------------
// chat.abort - cancel running turns for the chat
// ---------------------------------------------------------------------------

fn handle_chat_abort(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let aborted = ctx.bus.abort(&identity);
    Ok(serde_json::json!({ "ok": true, "aborted": aborted }))
}

// ---------------------------------------------------------------------------
// sessions.* - session management for a chat
// ---------------------------------------------------------------------------

async fn handle_sessions_list(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let limit = params["limit"].as_u64().map(|n| n as usize).unwrap_or(usize::MAX);
    let sessions: Vec<_> = ctx
        .bus
        .runtime()
        .sessions()
        .list(&identity)
        .await
        .into_iter()
        .take(limit)
        .collect();
    Ok(serde_json::json!({ "sessions": sessions }))
}

async fn handle_sessions_create(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let store = ctx.bus.runtime().sessions();
    let request = NewSession {
        key: optional_str(&params, "session_key"),
        title: optional_str(&params, "title"),
        seed: optional_str(&params, "seed"),
        allow_existing: params["allow_existing"].as_bool().unwrap_or(false),
    };
    let created = store.create(&identity, request).await.map_err(rpc_error)?;
    let session = if params["activate"].as_bool().unwrap_or(true) {
        store
            .switch(&identity, created.key.as_str())
            .await
            .map_err(rpc_error)?
    } else {
        created
    };
    Ok(serde_json::json!({ "session": session }))
}

async fn handle_sessions_switch(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let key = require_str(&params, "session")?;
    let session = ctx
        .bus
        .runtime()
        .sessions()
        .switch(&identity, key)
        .await
        .map_err(rpc_error)?;
    Ok(serde_json::json!({ "session": session }))
}

async fn handle_sessions_reset(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let store = ctx.bus.runtime().sessions();
    store.reset(&identity).await.map_err(rpc_error)?;
    Ok(serde_json::json!({
        "ok": true,
        "session": identity.default_session_key().as_str(),
    }))
}

async fn handle_sessions_current(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let current = ctx.bus.runtime().sessions().current(&identity).await;
    Ok(serde_json::json!({ "session": current }))
}

async fn handle_sessions_delete(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let identity = identity(&params)?;
    let key = require_str(&params, "session")?;
    let deleted = ctx
        .bus
        .runtime()
        .sessions()
        .delete(&identity, key)
        .await
        .map_err(rpc_error)?;
    info!("Deleted session: {}", deleted);
    Ok(serde_json::json!({ "ok": true, "session": deleted.as_str() }))
}

// ---------------------------------------------------------------------------
// tools.list - list available tools
// ---------------------------------------------------------------------------

fn handle_tools_list(ctx: &ConnectionContext) -> RpcResult {
    let tools: Vec<Value> = ctx
        .bus
        .runtime()
        .tool_definitions()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
            })
        })
        .collect();
    Ok(serde_json::json!({ "tools": tools }))
}

// ---------------------------------------------------------------------------
// health - gateway health check
// ---------------------------------------------------------------------------

fn handle_health(ctx: &ConnectionContext) -> RpcResult {
    let runtime = ctx.bus.runtime();
    Ok(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model": runtime.config().model,
        "sessions": runtime.sessions().len(),
        "tools": runtime.tools().len(),
        "channels": ctx.bus.channels(),
    }))
}
