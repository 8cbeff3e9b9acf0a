//! Session management tool: create, switch, list, and reset the sessions of
//! the chat the call came from.
//!
//! The tool does not hold the session store. Every state change goes through
//! a [`SessionControl`] handle provided by the agent crate, which keeps the
//! store's own locking and rollback rules in charge.

use crate::registry::{Tool, ToolContext, ToolResult};
use nanoclaw_core::{ChannelIdentity, NewSession, Result, SessionSummary};
use serde_json::{json, Value};
use std::sync::Arc;

/// Session operations the tool layer may request.
#[async_trait::async_trait]
pub trait SessionControl: Send + Sync {
    /// Create a session under `identity`. Does not activate it.
    async fn create(&self, identity: &ChannelIdentity, params: NewSession)
        -> Result<SessionSummary>;
    /// Make `key` (full key or bare name) the active session for `identity`.
    async fn switch(&self, identity: &ChannelIdentity, key: &str) -> Result<SessionSummary>;
    /// Sessions owned by `identity`, most recently updated first.
    async fn list(&self, identity: &ChannelIdentity) -> Result<Vec<SessionSummary>>;
    /// The overriding session, if one is switched in.
    async fn current(&self, identity: &ChannelIdentity) -> Result<Option<SessionSummary>>;
    /// Drop the override; idempotent.
    async fn reset(&self, identity: &ChannelIdentity) -> Result<()>;
}

pub type SessionControlHandle = Arc<dyn SessionControl>;

pub struct SessionManageTool {
    control: SessionControlHandle,
}

impl SessionManageTool {
    pub fn new(control: SessionControlHandle) -> Self {
        Self { control }
    }

    async fn create(&self, identity: &ChannelIdentity, args: &Value) -> ToolResult {
        let params = NewSession {
            key: str_arg(args, "session_key"),
            title: str_arg(args, "title"),
            seed: str_arg(args, "seed"),
            allow_existing: args["allow_existing"].as_bool().unwrap_or(false),
        };
        let activate = args["activate"].as_bool().unwrap_or(true);

        let created = match self.control.create(identity, params).await {
            Ok(s) => s,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        if !activate {
            return ToolResult::text(format!(
                "Created session: {} (title: {})",
                created.key, created.title
            ));
        }
        match self.control.switch(identity, created.key.as_str()).await {
            Ok(s) => ToolResult::text(format!(
                "Created and activated session: {} (title: {})",
                s.key, s.title
            )),
            Err(e) => ToolResult::error(format!(
                "created {} but could not activate it: {}",
                created.key, e
            )),
        }
    }

    async fn switch(&self, identity: &ChannelIdentity, args: &Value) -> ToolResult {
        let key = match str_arg(args, "session_key") {
            Some(k) => k,
            None => return ToolResult::error("session_key is required for switch"),
        };
        match self.control.switch(identity, &key).await {
            Ok(s) => ToolResult::text(format!(
                "Switched active session to: {}{}",
                s.key,
                title_part(&s)
            )),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn list(&self, identity: &ChannelIdentity, args: &Value) -> ToolResult {
        let limit = args["limit"].as_u64().unwrap_or(20).max(1) as usize;
        let sessions = match self.control.list(identity).await {
            Ok(s) => s,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        if sessions.is_empty() {
            return ToolResult::text("No sessions found.");
        }
        ToolResult::text(format_session_list(&sessions, limit))
    }

    async fn current(&self, identity: &ChannelIdentity) -> ToolResult {
        match self.control.current(identity).await {
            Ok(Some(s)) => ToolResult::text(format!(
                "Current active session: {}{}",
                s.key,
                title_part(&s)
            )),
            Ok(None) => {
                ToolResult::text("No active session override (using default channel session).")
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn reset(&self, identity: &ChannelIdentity) -> ToolResult {
        match self.control.reset(identity).await {
            Ok(()) => ToolResult::text(
                "Cleared active session override (back to default channel session).",
            ),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

/// Numbered listing with `*` on the active session.
pub fn format_session_list(sessions: &[SessionSummary], limit: usize) -> String {
    let lines: Vec<String> = sessions
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, s)| {
            let mark = if s.active { "*" } else { " " };
            format!(
                "{}. {} {} | {} | updated {}",
                idx + 1,
                mark,
                s.key,
                s.title,
                s.updated_at.format("%Y-%m-%d %H:%M:%S")
            )
        })
        .collect();
    format!("Sessions:\n{}", lines.join("\n"))
}

fn title_part(s: &SessionSummary) -> String {
    if s.title.is_empty() {
        String::new()
    } else {
        format!(" (title: {})", s.title)
    }
}

fn str_arg(args: &Value, name: &str) -> Option<String> {
    args[name]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[async_trait::async_trait]
impl Tool for SessionManageTool {
    fn name(&self) -> &str {
        "session_manage"
    }

    fn description(&self) -> &str {
        "Manage conversation sessions. Actions: create, switch, list, current, reset. \
         Create generates a title and can activate the new session; switch activates an existing session."
    }

    fn prompt(&self) -> &str {
        "Use session_manage when the user asks to start a new topic, go back to an earlier \
         conversation, or see their sessions. Switching takes effect from the next message."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "switch", "list", "current", "reset"],
                    "description": "Action to perform"
                },
                "session_key": {
                    "type": "string",
                    "description": "Target session key for switch/create"
                },
                "title": { "type": "string", "description": "Optional title for new session" },
                "seed": {
                    "type": "string",
                    "description": "Optional seed text to auto-generate a title"
                },
                "activate": {
                    "type": "boolean",
                    "description": "Whether to activate the session after create",
                    "default": true
                },
                "limit": { "type": "integer", "description": "Max sessions to list", "default": 20 },
                "allow_existing": {
                    "type": "boolean",
                    "description": "Allow create to reuse an existing session key",
                    "default": false
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let identity = &ctx.identity;
        match args["action"].as_str().unwrap_or_default() {
            "create" => self.create(identity, &args).await,
            "switch" => self.switch(identity, &args).await,
            "list" => self.list(identity, &args).await,
            "current" => self.current(identity).await,
            "reset" => self.reset(identity).await,
            other => ToolResult::error(format!("Unknown action: {}", other)),
        }
    }
}
