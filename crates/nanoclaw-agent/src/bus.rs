//! Message bus: inbound messages in, agent output out to the right channel
//!
//! Each inbound message is handled by its own task. Agent events are
//! converted to [`Outbound`] traffic and handed to the adapter registered for
//! the identity's channel. Delivery is best-effort; failures are counted and
//! logged, never retried here.

use crate::runtime::{AgentEvent, AgentRuntime, TurnOutcome};
use dashmap::DashMap;
use nanoclaw_core::{ChannelIdentity, Error, InboundMessage, Outbound, OutboundMessage, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A chat surface that can deliver outbound traffic.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name, matched against `ChannelIdentity::channel`.
    fn name(&self) -> &str;

    async fn deliver(&self, outbound: &Outbound) -> Result<()>;
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub outcome: TurnOutcome,
    pub delivered: usize,
    pub failed: usize,
}

pub struct MessageBus {
    runtime: Arc<AgentRuntime>,
    channels: DashMap<String, Arc<dyn ChannelAdapter>>,
    inflight: DashMap<ChannelIdentity, Vec<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self {
            runtime,
            channels: DashMap::new(),
            inflight: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Register an adapter, replacing any adapter with the same name.
    pub fn register_channel(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        if self.channels.insert(name.clone(), adapter).is_some() {
            warn!(channel = %name, "channel adapter replaced");
        } else {
            info!(channel = %name, "channel adapter registered");
        }
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn track(&self, identity: &ChannelIdentity) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inflight
            .entry(identity.clone())
            .or_default()
            .push((id, token.clone()));
        (id, token)
    }

    fn untrack(&self, identity: &ChannelIdentity, id: u64) {
        if let Some(mut running) = self.inflight.get_mut(identity) {
            running.retain(|(i, _)| *i != id);
        }
        self.inflight.remove_if(identity, |_, running| running.is_empty());
    }

    /// Cancel every running turn for `identity`. Returns how many were running.
    pub fn abort(&self, identity: &ChannelIdentity) -> usize {
        match self.inflight.remove(identity) {
            Some((_, running)) => {
                for (_, token) in &running {
                    token.cancel();
                }
                info!(identity = %identity, count = running.len(), "aborted running turns");
                running.len()
            }
            None => 0,
        }
    }

    pub fn is_running(&self, identity: &ChannelIdentity) -> bool {
        self.inflight.contains_key(identity)
    }

    /// Run `inbound` through the agent and deliver everything it produces.
    pub async fn handle(&self, inbound: InboundMessage) -> Result<Dispatched> {
        let identity = inbound.identity.clone();
        let (id, cancel) = self.track(&identity);
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let text = inbound.prompt_text();

        let run = self.runtime.run_turn(&identity, &text, tx, cancel);
        let drain = async {
            let mut delivered = 0;
            let mut failed = 0;
            while let Some(event) = rx.recv().await {
                let outbound = match to_outbound(&identity, event) {
                    Some(o) => o,
                    None => continue,
                };
                match self.deliver(&outbound).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(identity = %identity, "delivery failed: {}", e);
                        failed += 1;
                    }
                }
            }
            (delivered, failed)
        };
        let (result, (delivered, failed)) = tokio::join!(run, drain);
        self.untrack(&identity, id);

        let outcome = result?;
        debug!(
            identity = %identity,
            delivered,
            failed,
            "inbound message handled"
        );
        Ok(Dispatched {
            outcome,
            delivered,
            failed,
        })
    }

    /// Handle `inbound` on its own task.
    pub fn dispatch(self: &Arc<Self>, inbound: InboundMessage) -> JoinHandle<Result<Dispatched>> {
        let bus = self.clone();
        tokio::spawn(async move { bus.handle(inbound).await })
    }

    /// Consume inbound messages until the sender side closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = inbound.recv().await {
            let identity = msg.identity.clone();
            let handle = self.dispatch(msg);
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(identity = %identity, "turn failed: {}", e),
                    Err(e) => warn!(identity = %identity, "turn task panicked: {}", e),
                }
            });
        }
        info!("inbound queue closed, message bus stopping");
    }

    /// Hand one outbound item to its channel.
    pub async fn deliver(&self, outbound: &Outbound) -> Result<()> {
        let channel = &outbound.identity().channel;
        let adapter = self
            .channels
            .get(channel)
            .map(|a| a.value().clone())
            .ok_or_else(|| Error::ChannelNotFound(channel.clone()))?;
        adapter.deliver(outbound).await
    }
}

/// Agent events that reach the user. Results and completion markers stay internal.
fn to_outbound(identity: &ChannelIdentity, event: AgentEvent) -> Option<Outbound> {
    match event {
        AgentEvent::ToolCall(n) => Some(Outbound::ToolCall(n)),
        AgentEvent::Message(m) => Some(Outbound::Message(m)),
        AgentEvent::Reply(text) if !text.trim().is_empty() => Some(Outbound::Message(
            OutboundMessage::text(identity.clone(), text),
        )),
        AgentEvent::Error(e) => Some(Outbound::Message(OutboundMessage::text(
            identity.clone(),
            format!("Sorry, I encountered an error: {}", e),
        ))),
        _ => None,
    }
}
