//! Nanoclaw LLM - Provider adapters with streaming support

pub mod anthropic;
pub mod provider;
pub mod scripted;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{collect_stream, LlmError, LlmProvider, LlmResult, LlmStream};
pub use scripted::{ScriptStep, ScriptedProvider};
pub use tokio_util::sync::CancellationToken;
pub use types::*;
