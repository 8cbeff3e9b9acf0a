//! Tool registry and trait definitions
//!
//! Each tool is a self-contained module implementing the Tool trait. The
//! registry is assembled once at startup and only read afterwards.

use crate::validation::validate_arguments;
use nanoclaw_core::{ChannelIdentity, Error, OutboundMessage, Result, SessionKey, ToolStatus};
use nanoclaw_llm::LlmTool;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum ToolResult {
    Text(String),
    Json(Value),
    Error(String),
    /// The invocation was cancelled before the handler finished.
    Cancelled,
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
            Self::Error(e) => format!("Error: {}", e),
            Self::Cancelled => "[cancelled]".to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Cancelled)
    }

    /// Status recorded on the tool-result turn.
    pub fn status(&self) -> ToolStatus {
        match self {
            Self::Text(_) | Self::Json(_) => ToolStatus::Ok,
            Self::Error(_) => ToolStatus::Failed,
            Self::Cancelled => ToolStatus::Cancelled,
        }
    }
}

/// What a handler may know about the invocation it serves.
///
/// Tools never see the session store; they get the identity and session key
/// the call belongs to, plus a sender for outbound messages.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub identity: ChannelIdentity,
    pub session: SessionKey,
    pub outbound: Option<mpsc::Sender<OutboundMessage>>,
}

impl ToolContext {
    pub fn new(identity: ChannelIdentity, session: SessionKey) -> Self {
        Self {
            identity,
            session,
            outbound: None,
        }
    }

    pub fn with_outbound(mut self, tx: mpsc::Sender<OutboundMessage>) -> Self {
        self.outbound = Some(tx);
        self
    }
}

/// The Tool trait: implement this to add a new capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "message", "session_manage").
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// System prompt fragment for this tool (injected into LLM context).
    fn prompt(&self) -> &str {
        ""
    }

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// Execute the tool with arguments that already passed schema validation.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;

    /// Execute with cancellation support. Default: race execute() against cancellation.
    async fn execute_cancellable(
        &self,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> ToolResult {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ToolResult::Cancelled,
            result = self.execute(args, ctx) => result,
        }
    }

    /// Convert to the LLM tool definition format.
    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Name → tool mapping. Ordered so definitions reach the model in a stable order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. A name that is already taken is rejected.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// Register a tool, replacing and returning any tool under the same name.
    pub fn replace(&mut self, tool: impl Tool + 'static) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Validate and run a tool.
    ///
    /// Lookup and schema failures are errors and the handler never runs.
    /// Handler failures come back as `Ok(ToolResult::Error(..))` so the model
    /// can see them.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        validate_arguments(&args, &tool.input_schema())
            .map_err(|v| Error::invalid_arguments(name, v.field, v.reason))?;

        debug!(tool = name, session = %ctx.session, "invoking tool");
        Ok(tool.execute_cancellable(args, ctx, cancel).await)
    }

    /// Get LLM tool definitions for all registered tools.
    pub fn definitions(&self) -> Vec<LlmTool> {
        self.tools.values().map(|t| t.to_llm_tool()).collect()
    }

    /// Get system prompt fragments from all registered tools.
    pub fn combined_prompts(&self) -> String {
        self.tools
            .values()
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
