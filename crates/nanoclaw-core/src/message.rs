//! Messages crossing the channel boundary.
//!
//! Inbound messages are normalized by a channel adapter before they reach the
//! bus. Outbound traffic has two kinds: replies/messages meant for the user,
//! and tool-call notifications that announce a tool before it runs. Both are
//! delivery events only; the session transcript is the record of what happened.

use crate::types::{ChannelIdentity, SessionKey};
use serde::{Deserialize, Serialize};

/// A user message as delivered by a channel adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub identity: ChannelIdentity,
    pub text: String,
    /// Local paths of media that arrived with the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
}

impl InboundMessage {
    pub fn new(identity: ChannelIdentity, text: impl Into<String>) -> Self {
        Self {
            identity,
            text: text.into(),
            media: Vec::new(),
        }
    }

    /// Text the model sees: the message plus a note per attachment.
    pub fn prompt_text(&self) -> String {
        if self.media.is_empty() {
            return self.text.clone();
        }
        let mut out = self.text.clone();
        for path in &self.media {
            out.push_str(&format!("\n[attachment: {}]", path));
        }
        out
    }
}

/// Text and/or media for a channel to deliver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub identity: ChannelIdentity,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl OutboundMessage {
    pub fn text(identity: ChannelIdentity, text: impl Into<String>) -> Self {
        Self {
            identity,
            text: text.into(),
            media: Vec::new(),
            title: None,
        }
    }
}

/// Announces a tool call before its result is known.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallNotification {
    pub identity: ChannelIdentity,
    pub session: SessionKey,
    pub call_id: String,
    pub name: String,
    /// Human-readable rendering of the call's arguments.
    pub summary: String,
}

/// Everything the core asks a channel to deliver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Message(OutboundMessage),
    ToolCall(ToolCallNotification),
}

impl Outbound {
    pub fn identity(&self) -> &ChannelIdentity {
        match self {
            Self::Message(m) => &m.identity,
            Self::ToolCall(n) => &n.identity,
        }
    }
}
