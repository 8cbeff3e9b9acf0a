//! Gateway server: WebSocket RPC endpoint plus a health probe

use crate::auth::ResolvedAuth;
use crate::ws::{handle_connection, WsState};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use nanoclaw_agent::MessageBus;
use nanoclaw_core::config::GatewaySection;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Routes for a prepared gateway state.
pub fn router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

/// Serve the gateway until the listener fails or ctrl-c arrives.
pub async fn start_gateway(config: &GatewaySection, bus: Arc<MessageBus>) -> anyhow::Result<()> {
    let auth = ResolvedAuth::new(config.token.clone());
    let auth_required = auth.required();
    let state = Arc::new(WsState::new(bus, auth));

    let bind_addr: SocketAddr = format!("{}:{}", config.bind.to_addr(), config.port).parse()?;

    info!("Nanoclaw Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Auth: {}", if auth_required { "token" } else { "none" });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    let runtime = state.bus.runtime();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model": runtime.config().model,
        "sessions": runtime.sessions().len(),
        "tools": runtime.tools().len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
