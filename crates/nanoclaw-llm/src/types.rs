//! LLM types for requests, streaming deltas, and collected responses

use serde::{Deserialize, Serialize};

/// LLM request
#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// Message in LLM conversation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

impl LlmMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: LlmContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: LlmContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: LlmContent::Text(text.into()),
        }
    }

    /// Concatenated text of the message, ignoring tool blocks.
    pub fn text(&self) -> String {
        match &self.content {
            LlmContent::Text(s) => s.clone(),
            LlmContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Rough token count: 4 chars per token plus per-message overhead.
    pub fn estimate_tokens(&self) -> usize {
        let chars = match &self.content {
            LlmContent::Text(s) => s.len(),
            LlmContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.len(),
                })
                .sum(),
        };
        chars / 4 + 10
    }
}

/// Message content - can be string or array of blocks
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self {
        LlmContent::Text(s)
    }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self {
        LlmContent::Text(s.to_string())
    }
}

impl LlmContent {
    /// Normalize to a block list so adjacent messages can be merged.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            LlmContent::Text(text) => vec![ContentBlock::Text { text }],
            LlmContent::Blocks(blocks) => blocks,
        }
    }
}

/// Content block types
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool definition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Streaming delta from LLM
#[derive(Clone, Debug)]
pub enum StreamDelta {
    Text(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    Done { stop_reason: Option<String>, usage: Option<Usage> },
    Error(String),
}

/// Token usage
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Accumulated tool call from streaming
#[derive(Clone, Debug, Default)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        // Tools with no parameters stream no argument bytes at all.
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Null when the streamed arguments were not valid JSON.
    pub arguments: serde_json::Value,
}

/// A fully collected completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<LlmToolCall>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    /// A response with no tool calls is a final answer.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Folds stream deltas into an [`LlmResponse`].
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    text: String,
    tool_calls: Vec<AccumulatedToolCall>,
    current_tool: Option<AccumulatedToolCall>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
    errors: Vec<String>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::Text(text) => self.text.push_str(&text),
            StreamDelta::ToolCallStart { id, name } => {
                if let Some(tool) = self.current_tool.take() {
                    self.tool_calls.push(tool);
                }
                self.current_tool = Some(AccumulatedToolCall {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            StreamDelta::ToolCallDelta { arguments, .. } => {
                if let Some(ref mut tool) = self.current_tool {
                    tool.arguments.push_str(&arguments);
                }
            }
            StreamDelta::ToolCallEnd { .. } => {
                if let Some(tool) = self.current_tool.take() {
                    self.tool_calls.push(tool);
                }
            }
            StreamDelta::Done { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if usage.is_some() {
                    self.usage = usage;
                }
            }
            StreamDelta::Error(e) => self.errors.push(e),
        }
    }

    /// In-band stream errors seen so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Partial text, for reporting what arrived before an interruption.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish(mut self) -> LlmResponse {
        if let Some(tool) = self.current_tool.take() {
            self.tool_calls.push(tool);
        }
        LlmResponse {
            text: self.text,
            tool_calls: self
                .tool_calls
                .into_iter()
                .map(|tc| LlmToolCall {
                    arguments: tc.parse_arguments().unwrap_or_default(),
                    id: tc.id,
                    name: tc.name,
                })
                .collect(),
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}
