//! WebSocket connection handling and the `ws` channel adapter
//!
//! Clients speak the JSON-RPC protocol from `nanoclaw_core::protocol`. Agent
//! output is fanned out to every connected client over a broadcast channel;
//! clients pick their own chat's events by the `chat` field.

use crate::auth::ResolvedAuth;
use crate::rpc::{self, ConnectionContext, WS_CHANNEL};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use nanoclaw_agent::{ChannelAdapter, MessageBus};
use nanoclaw_core::protocol::{EventMessage, IncomingMessage, RpcResponse, CODE_AUTH};
use nanoclaw_core::{Error, Outbound, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shared state for WebSocket connections.
pub struct WsState {
    pub auth: ResolvedAuth,
    pub bus: Arc<MessageBus>,
    /// Broadcast channel for chat events - all WS clients subscribe.
    pub events: broadcast::Sender<EventMessage>,
    pub started_at: std::time::Instant,
}

impl WsState {
    /// State with a fresh broadcast channel and the `ws` adapter registered on `bus`.
    pub fn new(bus: Arc<MessageBus>, auth: ResolvedAuth) -> Self {
        let (events, _) = broadcast::channel::<EventMessage>(1024);
        bus.register_channel(Arc::new(WsChannel::new(events.clone())));
        Self {
            auth,
            bus,
            events,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Delivers outbound traffic for `ws:*` identities as broadcast events.
pub struct WsChannel {
    events: broadcast::Sender<EventMessage>,
}

impl WsChannel {
    pub fn new(events: broadcast::Sender<EventMessage>) -> Self {
        Self { events }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WsChannel {
    fn name(&self) -> &str {
        WS_CHANNEL
    }

    async fn deliver(&self, outbound: &Outbound) -> Result<()> {
        self.events
            .send(EventMessage::from_outbound(outbound))
            .map(|receivers| debug!(receivers, "ws event broadcast"))
            .map_err(|_| Error::DeliveryFailed("no websocket clients connected".into()))
    }
}

/// Handle one WebSocket connection until the client goes away.
pub async fn handle_connection(socket: WebSocket, state: Arc<WsState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events_rx = state.events.subscribe();

    let info_event = EventMessage::info(env!("CARGO_PKG_VERSION"));
    if let Ok(json) = serde_json::to_string(&info_event) {
        let _ = ws_tx.send(WsMessage::Text(json)).await;
    }

    let mut authenticated = !state.auth.required();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        for response_json in handle_text_message(&text, &state, &mut authenticated).await {
                            if ws_tx.send(WsMessage::Text(response_json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) => {
                        if let Ok(json) = serde_json::to_string(&EventMessage::pong()) {
                            let _ = ws_tx.send(WsMessage::Text(json)).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Client disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return;
                    }
                    None => return,
                    _ => {}
                }
            }

            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event broadcast closed");
                        return;
                    }
                }
            }
        }
    }
}

/// Handle a text frame. Returns JSON strings to send back to the client.
pub async fn handle_text_message(
    text: &str,
    state: &WsState,
    authenticated: &mut bool,
) -> Vec<String> {
    let mut responses = Vec::new();

    match serde_json::from_str::<IncomingMessage>(text) {
        Ok(IncomingMessage::Rpc(req)) => {
            let resp = if req.method == "auth" {
                match state.auth.verify_token(req.params["token"].as_str()) {
                    Ok(()) => {
                        *authenticated = true;
                        info!("Client authenticated (RPC)");
                        RpcResponse::ok(&req.id, serde_json::json!({ "ok": true }))
                    }
                    Err(e) => {
                        warn!("Auth failed: {}", e);
                        RpcResponse::err(&req.id, CODE_AUTH, e.to_string())
                    }
                }
            } else {
                let ctx = ConnectionContext {
                    authenticated: *authenticated,
                    bus: state.bus.clone(),
                    events: state.events.clone(),
                };
                let result = rpc::route_rpc(&req.method, req.params, &ctx).await;
                rpc::to_response(&req.id, result)
            };
            if let Ok(json) = serde_json::to_string(&resp) {
                responses.push(json);
            }
        }

        Ok(IncomingMessage::Auth { token }) => {
            let evt = match state.auth.verify_token(token.as_deref()) {
                Ok(()) => {
                    *authenticated = true;
                    info!("Client authenticated (shorthand)");
                    EventMessage::auth_result(true, None)
                }
                Err(e) => {
                    warn!("Auth failed: {}", e);
                    EventMessage::auth_result(false, Some(&e.to_string()))
                }
            };
            if let Ok(json) = serde_json::to_string(&evt) {
                responses.push(json);
            }
        }

        Err(_) => {
            warn!(
                "Unparseable message: {}",
                text.chars().take(100).collect::<String>()
            );
        }
    }

    responses
}
