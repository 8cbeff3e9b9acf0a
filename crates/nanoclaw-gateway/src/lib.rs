//! Nanoclaw Gateway - terminal chat, WebSocket RPC server, and runtime wiring

pub mod app;
pub mod auth;
pub mod cli;
pub mod rpc;
pub mod server;
pub mod ws;

pub use app::{anthropic_provider, build_bus, open_store, system_prompt};
pub use server::{router, start_gateway};
