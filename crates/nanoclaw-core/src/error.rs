//! Error types for Nanoclaw

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments {
        tool: String,
        /// The offending field, when the violation is tied to one.
        field: Option<String>,
        reason: String,
    },

    #[error("tool error: {name} - {message}")]
    ToolExecution { name: String, message: String },

    #[error("provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    #[error("iteration limit exceeded after {0} iterations")]
    IterationLimitExceeded(usize),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn session_not_found(key: impl Into<String>) -> Self {
        Self::SessionNotFound(key.into())
    }

    pub fn invalid_arguments(
        tool: impl Into<String>,
        field: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            field,
            reason: reason.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed(reason.into())
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn tool_execution(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Lookup failures a channel should show to the user rather than log.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_)
                | Self::UnknownTool(_)
                | Self::DuplicateName(_)
                | Self::InvalidArguments { .. }
        )
    }
}
