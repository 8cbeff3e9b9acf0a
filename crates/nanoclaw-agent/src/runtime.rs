//! Agent runtime - the model/tool loop for one inbound message
//!
//! One invocation at a time per channel identity: a run lock is held from
//! resolving the active session to the end of the turn, so a switch made by
//! one turn applies to the next message from the same chat. Everything that happens is appended to the session transcript
//! as it happens. Events sent on the channel are for live delivery only and
//! may be dropped.

use crate::context::ContextBuilder;
use crate::format::format_tool_call;
use crate::session::SessionStore;
use dashmap::DashMap;
use nanoclaw_core::{
    ChannelIdentity, Error, NanoclawConfig, OutboundMessage, Result, SessionKey,
    TerminationReason, ToolCallNotification, ToolStatus, Turn,
};
use nanoclaw_llm::{LlmError, LlmProvider, LlmRequest, LlmTool, LlmToolCall};
use nanoclaw_tools::{ToolContext, ToolRegistry, ToolResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a tool gets to wind down after its deadline passes.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// Sent before the tool runs.
    ToolCall(ToolCallNotification),
    ToolResult {
        call_id: String,
        name: String,
        status: ToolStatus,
    },
    /// Sent by a tool (e.g. `message`) while the turn is running.
    Message(OutboundMessage),
    Reply(String),
    Error(String),
    Done {
        reason: TerminationReason,
    },
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub max_iterations: usize,
    pub timeout: Duration,
    pub context_tokens: usize,
    pub max_tokens: u32,
    pub max_tool_result_chars: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_iterations: 20,
            timeout: Duration::from_secs(300),
            context_tokens: 64_000,
            max_tokens: 8192,
            max_tool_result_chars: 16_000,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &NanoclawConfig, system_prompt: Option<String>) -> Self {
        let agent = &config.agent;
        Self {
            model: agent.model.clone(),
            max_iterations: agent.max_iterations.max(1),
            timeout: Duration::from_secs(agent.timeout_secs.max(1)),
            context_tokens: agent.context_tokens,
            max_tokens: agent.max_tokens,
            max_tool_result_chars: agent.max_tool_result_chars,
            system_prompt,
        }
    }
}

/// Per-invocation loop bookkeeping. Never persisted.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration_count: usize,
    pub max_iterations: usize,
    pub pending_tool_calls: VecDeque<LlmToolCall>,
    pub termination: Option<TerminationReason>,
}

impl LoopState {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            iteration_count: 0,
            max_iterations,
            pending_tool_calls: VecDeque::new(),
            termination: None,
        }
    }

    fn outcome(&mut self, session: &SessionKey, reason: TerminationReason) -> TurnOutcome {
        self.termination = Some(reason);
        TurnOutcome {
            session: session.clone(),
            reason,
            iterations: self.iteration_count,
            reply: None,
            error: None,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub session: SessionKey,
    pub reason: TerminationReason,
    pub iterations: usize,
    pub reply: Option<String>,
    pub error: Option<String>,
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    context: ContextBuilder,
    system_prompt: Option<String>,
    config: AgentConfig,
    run_locks: DashMap<ChannelIdentity, Arc<Mutex<()>>>,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        sessions: Arc<SessionStore>,
        config: AgentConfig,
    ) -> Self {
        let tool_prompts = tools.combined_prompts();
        let system_prompt = match (config.system_prompt.as_deref(), tool_prompts.is_empty()) {
            (Some(base), false) => Some(format!("{}\n\n{}", base, tool_prompts)),
            (Some(base), true) => Some(base.to_string()),
            (None, false) => Some(tool_prompts),
            (None, true) => None,
        };
        Self {
            provider,
            tools: Arc::new(tools),
            sessions,
            context: ContextBuilder::new(config.context_tokens),
            system_prompt,
            config,
            run_locks: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
    pub fn tool_definitions(&self) -> Vec<LlmTool> {
        self.tools.definitions()
    }
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    fn run_lock(&self, identity: &ChannelIdentity) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(identity.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the lock entry once no turn holds or waits on it.
    fn release_run_lock(&self, identity: &ChannelIdentity, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.run_locks
            .remove_if(identity, |_, l| Arc::strong_count(l) == 1);
    }

    /// Run one inbound message through the active session of `identity`.
    ///
    /// Messages from one identity queue behind each other. The timeout starts
    /// once the turn holds the run lock, and a turn cancelled while queued
    /// still records its message and the interruption. Provider failures,
    /// timeouts and cancellation end the turn with the matching
    /// [`TerminationReason`]. Only session store failures come back as `Err`.
    pub async fn run_turn(
        &self,
        identity: &ChannelIdentity,
        text: &str,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let lock = self.run_lock(identity);
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(identity, text, &events, &cancel).await
        };
        self.release_run_lock(identity, lock);
        result
    }

    async fn run_locked(
        &self,
        identity: &ChannelIdentity,
        text: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let key = self.sessions.resolve_active_key(identity).await?;
        let deadline = Instant::now() + self.config.timeout;

        match self
            .drive(identity, &key, text, events, cancel, deadline)
            .await
        {
            Ok(outcome) => Ok(self.finish(events, outcome).await),
            Err(e) => {
                warn!(session = %key, "turn aborted: {}", e);
                let _ = events.send(AgentEvent::Error(e.to_string())).await;
                let _ = events
                    .send(AgentEvent::Done {
                        reason: TerminationReason::FatalError,
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn finish(&self, events: &mpsc::Sender<AgentEvent>, outcome: TurnOutcome) -> TurnOutcome {
        info!(
            session = %outcome.session,
            reason = %outcome.reason,
            iterations = outcome.iterations,
            "turn finished"
        );
        let _ = events
            .send(AgentEvent::Done {
                reason: outcome.reason,
            })
            .await;
        outcome
    }

    async fn drive(
        &self,
        identity: &ChannelIdentity,
        key: &SessionKey,
        text: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<TurnOutcome> {
        self.sessions.append(key, Turn::user(text)).await?;

        let tools = self.tools.definitions();
        let mut state = LoopState::new(self.config.max_iterations);
        let mut last_text: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return self
                    .interrupted(key, &mut state, TerminationReason::Cancelled)
                    .await;
            }

            let session = self
                .sessions
                .get(key)
                .await
                .ok_or_else(|| Error::session_not_found(key.as_str()))?;
            let request = LlmRequest {
                model: self.config.model.clone(),
                messages: self
                    .context
                    .build(&session, self.system_prompt.as_deref(), &tools),
                tools: Some(tools.clone()),
                max_tokens: Some(self.config.max_tokens),
                ..Default::default()
            };
            debug!(
                session = %key,
                iteration = state.iteration_count + 1,
                messages = request.messages.len(),
                "calling model"
            );

            let call_cancel = cancel.child_token();
            let response = tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    call_cancel.cancel();
                    return self.interrupted(key, &mut state, TerminationReason::Timeout).await;
                }
                r = self.provider.complete(request, call_cancel.clone()) => r,
            };

            let response = match response {
                Ok(r) => r,
                Err(LlmError::Cancelled) => {
                    return self
                        .interrupted(key, &mut state, TerminationReason::Cancelled)
                        .await;
                }
                Err(e) => {
                    let err = e.into_error(self.provider.name());
                    warn!(session = %key, "model call failed: {}", err);
                    let _ = events.send(AgentEvent::Error(err.to_string())).await;
                    return Ok(TurnOutcome {
                        error: Some(err.to_string()),
                        ..state.outcome(key, TerminationReason::FatalError)
                    });
                }
            };

            if response.is_final() {
                self.sessions
                    .append(key, Turn::assistant(response.text.clone()))
                    .await?;
                let _ = events.send(AgentEvent::Reply(response.text.clone())).await;
                return Ok(TurnOutcome {
                    reply: Some(response.text),
                    ..state.outcome(key, TerminationReason::FinalAnswer)
                });
            }

            if !response.text.trim().is_empty() {
                self.sessions
                    .append(key, Turn::assistant(response.text.clone()))
                    .await?;
                last_text = Some(response.text);
            }

            state.pending_tool_calls = response.tool_calls.into();
            while let Some(call) = state.pending_tool_calls.pop_front() {
                if let Some(reason) = self
                    .dispatch(identity, key, call, events, cancel, deadline)
                    .await?
                {
                    state.pending_tool_calls.clear();
                    return self.interrupted(key, &mut state, reason).await;
                }
            }

            state.iteration_count += 1;
            debug!(session = %key, iteration = state.iteration_count, "tool round complete");

            if state.iteration_count >= state.max_iterations {
                let notice = match &last_text {
                    Some(partial) => format!(
                        "{}\n\n[stopped: limit of {} tool iterations reached]",
                        partial, state.max_iterations
                    ),
                    None => format!(
                        "Reached the limit of {} tool iterations before finishing.",
                        state.max_iterations
                    ),
                };
                self.sessions
                    .append(key, Turn::assistant(notice.clone()))
                    .await?;
                let _ = events.send(AgentEvent::Reply(notice.clone())).await;
                return Ok(TurnOutcome {
                    reply: Some(notice),
                    ..state.outcome(key, TerminationReason::IterationLimit)
                });
            }
        }
    }

    /// Announce, record, run and record one tool call. Returns the reason the
    /// turn must stop, if the call was interrupted.
    async fn dispatch(
        &self,
        identity: &ChannelIdentity,
        key: &SessionKey,
        call: LlmToolCall,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Option<TerminationReason>> {
        let _ = events
            .send(AgentEvent::ToolCall(ToolCallNotification {
                identity: identity.clone(),
                session: key.clone(),
                call_id: call.id.clone(),
                name: call.name.clone(),
                summary: format_tool_call(&call.name, &call.arguments),
            }))
            .await;
        self.sessions
            .append(
                key,
                Turn::tool_call(&call.id, &call.name, call.arguments.clone()),
            )
            .await?;

        let (out_tx, out_rx) = mpsc::channel(16);
        let forward = tokio::spawn(forward_messages(out_rx, events.clone()));
        let ctx = ToolContext::new(identity.clone(), key.clone()).with_outbound(out_tx);
        let tool_cancel = cancel.child_token();

        let (result, timed_out) = {
            let invoke = self
                .tools
                .invoke(&call.name, call.arguments, &ctx, tool_cancel.clone());
            tokio::pin!(invoke);
            tokio::select! {
                biased;
                r = &mut invoke => (r, false),
                _ = sleep_until(deadline) => {
                    tool_cancel.cancel();
                    let r = timeout(CANCEL_GRACE, &mut invoke)
                        .await
                        .unwrap_or(Ok(ToolResult::Cancelled));
                    (r, true)
                }
            }
        };
        drop(ctx);
        let _ = forward.await;

        let result = result.unwrap_or_else(|e| {
            warn!(session = %key, tool = %call.name, "tool call rejected: {}", e);
            ToolResult::error(e.to_string())
        });
        let status = result.status();
        let output = truncate_tool_output(
            result.to_content_string(),
            self.config.max_tool_result_chars,
        );
        self.sessions
            .append(
                key,
                Turn::tool_result(&call.id, &call.name, output, status),
            )
            .await?;
        let _ = events
            .send(AgentEvent::ToolResult {
                call_id: call.id,
                name: call.name,
                status,
            })
            .await;

        Ok(if timed_out {
            Some(TerminationReason::Timeout)
        } else if cancel.is_cancelled() {
            Some(TerminationReason::Cancelled)
        } else {
            None
        })
    }

    async fn interrupted(
        &self,
        key: &SessionKey,
        state: &mut LoopState,
        reason: TerminationReason,
    ) -> Result<TurnOutcome> {
        self.sessions
            .append(
                key,
                Turn::assistant(format!("[turn interrupted: {}]", reason)),
            )
            .await?;
        Ok(state.outcome(key, reason))
    }
}

async fn forward_messages(
    mut rx: mpsc::Receiver<OutboundMessage>,
    events: mpsc::Sender<AgentEvent>,
) {
    while let Some(msg) = rx.recv().await {
        if events.send(AgentEvent::Message(msg)).await.is_err() {
            debug!("event receiver gone, dropping tool message");
        }
    }
}

/// Cut tool output at a char boundary, noting the original length.
pub fn truncate_tool_output(output: String, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output;
    }
    let cut: String = output.chars().take(max_chars).collect();
    format!("{}...[truncated, {} total chars]", cut, total)
}
