//! Core types for Nanoclaw

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0.to_string()
    }
}

/// The (channel, chat) pair a conversation arrives from, e.g. `telegram:12345`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel: String,
    pub chat_id: String,
}

impl ChannelIdentity {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Key of the session an identity falls back to when nothing is switched in.
    pub fn default_session_key(&self) -> SessionKey {
        SessionKey::new(self.to_string())
    }

    /// Whether `key` names a session owned by this identity.
    pub fn owns(&self, key: &SessionKey) -> bool {
        let base = self.to_string();
        key.as_str() == base
            || key
                .as_str()
                .strip_prefix(&base)
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl std::fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.chat_id)
    }
}

impl std::str::FromStr for ChannelIdentity {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((channel, chat_id)) if !channel.is_empty() && !chat_id.is_empty() => {
                Ok(Self::new(channel, chat_id))
            }
            _ => Err(crate::Error::Config(format!(
                "invalid channel identity '{}', expected channel:chat_id",
                s
            ))),
        }
    }
}

/// Who authored a transcript entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

/// Outcome of one tool invocation as recorded in the transcript.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: String,
        status: ToolStatus,
    },
}

/// One entry in a session transcript.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(TurnRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(TurnRole::Assistant, text)
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            role: TurnRole::ToolCall,
            content: TurnContent::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            },
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        status: ToolStatus,
    ) -> Self {
        Self {
            role: TurnRole::ToolResult,
            content: TurnContent::ToolResult {
                call_id: call_id.into(),
                name: name.into(),
                output: output.into(),
                status,
            },
            timestamp: Utc::now(),
        }
    }

    fn text(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text { text: text.into() },
            timestamp: Utc::now(),
        }
    }

    /// Text body for user/assistant turns.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Everything the model would read for this turn, flattened.
    pub fn render(&self) -> String {
        match &self.content {
            TurnContent::Text { text } => text.clone(),
            TurnContent::ToolCall {
                name, arguments, ..
            } => format!("{} {}", name, arguments),
            TurnContent::ToolResult { output, .. } => output.clone(),
        }
    }
}

/// Why an agent loop invocation stopped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    FinalAnswer,
    IterationLimit,
    Timeout,
    FatalError,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinalAnswer => "final-answer",
            Self::IterationLimit => "iteration-limit",
            Self::Timeout => "timeout",
            Self::FatalError => "fatal-error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing entry for a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: usize,
    pub active: bool,
}

/// Parameters for creating a session under a channel identity.
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    /// Full key (`channel:chat:name`) or a bare name to slugify. Generated when absent.
    pub key: Option<String>,
    pub title: Option<String>,
    /// Free text to derive a title from when no title is given.
    pub seed: Option<String>,
    /// Reuse the session if the key already exists instead of failing.
    pub allow_existing: bool,
}

impl NewSession {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}
