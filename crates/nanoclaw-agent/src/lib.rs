//! Nanoclaw Agent - session store, context assembly, the agent loop, and the message bus

pub mod bus;
pub mod context;
pub mod control;
pub mod format;
pub mod persist;
pub mod runtime;
pub mod session;

pub use bus::{ChannelAdapter, Dispatched, MessageBus};
pub use context::ContextBuilder;
pub use format::format_tool_call;
pub use persist::JsonlStore;
pub use runtime::{
    truncate_tool_output, AgentConfig, AgentEvent, AgentRuntime, LoopState, TurnOutcome,
};
pub use session::{slugify, Session, SessionStore};
