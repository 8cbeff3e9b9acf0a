//! ScriptedProvider: deterministic LLM responses for tests and offline runs
//!
//! Each call to `complete_stream` pops the next step of the script. Once the
//! script is exhausted every call answers with a fixed text.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta};
use async_stream::stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const EXHAUSTED_TEXT: &str = "(script exhausted)";

/// One scripted model response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// A final answer.
    Text(String),
    /// Interim text (possibly empty) followed by tool calls.
    ToolCalls { text: String, calls: Vec<(String, Value)> },
    /// The provider call fails.
    Fail(String),
    /// Never answers; only cancellation ends the call.
    Stall,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(name: impl Into<String>, args: Value) -> Self {
        Self::ToolCalls {
            text: String::new(),
            calls: vec![(name.into(), args)],
        }
    }

    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        Self::ToolCalls {
            text: String::new(),
            calls: calls
                .into_iter()
                .map(|(name, args)| (name.to_string(), args))
                .collect(),
        }
    }
}

pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<LlmRequest>>,
    call_count: Mutex<usize>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            call_count: Mutex::new(0),
            latency: None,
        }
    }

    /// Delay every response by `latency` before the first delta.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append steps to the end of the script.
    pub async fn push(&self, step: ScriptStep) {
        self.steps.lock().await.push_back(step);
    }

    pub async fn call_count(&self) -> usize {
        *self.call_count.lock().await
    }

    /// Every request seen so far, in call order.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.steps.lock().await.len()
    }

    async fn next_step(&self, request: LlmRequest) -> (usize, ScriptStep) {
        let mut count = self.call_count.lock().await;
        *count += 1;
        self.requests.lock().await.push(request);
        let step = self
            .steps
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| ScriptStep::text(EXHAUSTED_TEXT));
        (*count, step)
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> &[&str] {
        &["scripted"]
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let (n, step) = self.next_step(request).await;
        if let ScriptStep::Fail(msg) = &step {
            return Err(LlmError::RequestFailed(msg.clone()));
        }
        let latency = self.latency;

        Ok(Box::pin(stream! {
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }
            match step {
                ScriptStep::Text(text) => {
                    let chars: Vec<char> = text.chars().collect();
                    for chunk in chars.chunks(20) {
                        yield Ok(StreamDelta::Text(chunk.iter().collect()));
                    }
                    yield Ok(StreamDelta::Done { stop_reason: Some("end_turn".into()), usage: None });
                }
                ScriptStep::ToolCalls { text, calls } => {
                    if !text.is_empty() {
                        yield Ok(StreamDelta::Text(text));
                    }
                    for (i, (name, args)) in calls.into_iter().enumerate() {
                        let id = format!("call_{}_{}", n, i);
                        yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name });
                        yield Ok(StreamDelta::ToolCallDelta {
                            id: id.clone(),
                            arguments: args.to_string(),
                        });
                        yield Ok(StreamDelta::ToolCallEnd { id });
                    }
                    yield Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None });
                }
                ScriptStep::Stall => {
                    match cancel {
                        Some(token) => token.cancelled().await,
                        None => futures::future::pending::<()>().await,
                    }
                    yield Err(LlmError::Cancelled);
                }
                ScriptStep::Fail(msg) => {
                    yield Err(LlmError::RequestFailed(msg));
                }
            }
        }))
    }
}
