//! Context window assembly with token budgeting
//!
//! Order is fixed: system prompt, tool declarations, then the transcript. When
//! the transcript does not fit, the oldest turns go first. The most recent
//! user turn always survives, and the kept window always starts at a user
//! turn so no tool result is left without its call.

use crate::session::Session;
use nanoclaw_core::{ToolStatus, Turn, TurnContent, TurnRole};
use nanoclaw_llm::{ContentBlock, LlmContent, LlmMessage, LlmTool};
use tracing::debug;

pub struct ContextBuilder {
    max_tokens: usize,
}

impl ContextBuilder {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn build(
        &self,
        session: &Session,
        system_prompt: Option<&str>,
        skills: &[LlmTool],
    ) -> Vec<LlmMessage> {
        self.build_from_turns(&session.transcript, system_prompt, skills)
    }

    pub fn build_from_turns(
        &self,
        transcript: &[Turn],
        system_prompt: Option<&str>,
        skills: &[LlmTool],
    ) -> Vec<LlmMessage> {
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(LlmMessage::system(prompt));
        }
        if !skills.is_empty() {
            messages.push(LlmMessage::system(declare_tools(skills)));
        }

        let fixed: usize = messages.iter().map(LlmMessage::estimate_tokens).sum();
        let budget = self.max_tokens.saturating_sub(fixed);
        let start = window_start(transcript, budget);
        if start > 0 {
            debug!(
                "context truncated: dropped {} of {} turns",
                start,
                transcript.len()
            );
        }

        for turn in &transcript[start..] {
            push_merged(&mut messages, turn_to_message(turn));
        }
        messages
    }
}

fn declare_tools(skills: &[LlmTool]) -> String {
    let mut out = String::from("Available tools:");
    for tool in skills {
        out.push_str(&format!("\n- {}: {}", tool.name, tool.description));
    }
    out
}

/// Index of the first turn to keep.
fn window_start(transcript: &[Turn], budget: usize) -> usize {
    let last_user = match transcript.iter().rposition(|t| t.role == TurnRole::User) {
        Some(i) => i,
        None => return 0,
    };

    let costs: Vec<usize> = transcript
        .iter()
        .map(|t| turn_to_message(t).estimate_tokens())
        .collect();
    let mut total: usize = costs.iter().sum();
    if total <= budget {
        return 0;
    }

    let mut start = 0;
    while total > budget && start < last_user {
        total -= costs[start];
        start += 1;
    }
    while start < last_user && transcript[start].role != TurnRole::User {
        start += 1;
    }
    start
}

/// Tool-call records are authored by the assistant; tool results go back as user input.
fn turn_to_message(turn: &Turn) -> LlmMessage {
    match &turn.content {
        TurnContent::Text { text } => match turn.role {
            TurnRole::User => LlmMessage::user(text.clone()),
            _ => LlmMessage::assistant(text.clone()),
        },
        TurnContent::ToolCall {
            call_id,
            name,
            arguments,
        } => LlmMessage {
            role: "assistant".into(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                id: call_id.clone(),
                name: name.clone(),
                input: arguments.clone(),
            }]),
        },
        TurnContent::ToolResult {
            call_id,
            output,
            status,
            ..
        } => LlmMessage {
            role: "user".into(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: call_id.clone(),
                content: output.clone(),
                is_error: (*status != ToolStatus::Ok).then_some(true),
            }]),
        },
    }
}

/// Adjacent messages with the same role are folded into one block list.
fn push_merged(messages: &mut Vec<LlmMessage>, next: LlmMessage) {
    match messages.last_mut() {
        Some(last) if last.role == next.role && last.role != "system" => {
            let mut blocks = std::mem::replace(&mut last.content, LlmContent::Blocks(Vec::new()))
                .into_blocks();
            blocks.extend(next.content.into_blocks());
            last.content = LlmContent::Blocks(blocks);
        }
        _ => messages.push(next),
    }
}
