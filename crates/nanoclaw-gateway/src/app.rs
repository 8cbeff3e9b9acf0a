//! Wiring: config → session store, tool registry, provider, runtime, bus

use nanoclaw_agent::{AgentConfig, AgentRuntime, MessageBus, SessionStore};
use nanoclaw_core::config::{bootstrap_to_system_prompt, load_bootstrap_files};
use nanoclaw_core::{Error, NanoclawConfig, Result};
use nanoclaw_llm::{AnthropicProvider, LlmProvider};
use nanoclaw_tools::{create_default_registry, SessionControlHandle};
use std::sync::Arc;
use tracing::info;

/// System prompt from config plus the workspace bootstrap files.
pub fn system_prompt(config: &NanoclawConfig) -> Option<String> {
    let bootstrap = bootstrap_to_system_prompt(&load_bootstrap_files(&config.workspace()));
    let parts: Vec<String> = config
        .agent
        .system_prompt
        .iter()
        .filter(|p| !p.trim().is_empty())
        .cloned()
        .chain(bootstrap)
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Session store per config: on disk under the sessions dir, or in memory when persistence is off.
pub fn open_store(config: &NanoclawConfig) -> Result<Arc<SessionStore>> {
    let store = match config.sessions_dir() {
        Some(dir) => {
            let store = SessionStore::open(&dir)?;
            info!(dir = %dir.display(), sessions = store.len(), "session store opened");
            store
        }
        None => {
            info!("session persistence disabled, keeping sessions in memory");
            SessionStore::in_memory()
        }
    };
    Ok(Arc::new(store))
}

/// Anthropic transport from config. Fails when no API key is available.
pub fn anthropic_provider(config: &NanoclawConfig) -> Result<Arc<dyn LlmProvider>> {
    let api_key = config
        .provider
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::Config("ANTHROPIC_API_KEY not set".into()))?;
    let mut provider = AnthropicProvider::new(api_key);
    if let Some(base) = config.provider.base_url.as_deref() {
        let url = messages_url(base);
        info!("Using custom API URL: {}", url);
        provider = provider.with_base_url(url);
    }
    Ok(Arc::new(provider))
}

/// `https://proxy` and `https://proxy/v1/messages` both address the messages endpoint.
fn messages_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1/messages") {
        base.to_string()
    } else {
        format!("{}/v1/messages", base)
    }
}

/// Build the message bus over a fresh runtime. Channels are registered by the caller.
pub fn build_bus(
    config: &NanoclawConfig,
    provider: Arc<dyn LlmProvider>,
    store: Arc<SessionStore>,
) -> Result<Arc<MessageBus>> {
    let control: SessionControlHandle = store.clone();
    let tools = create_default_registry(control, config.media_dir())?;
    info!("Registered tools: {:?}", tools.list());

    let agent_config = AgentConfig::from_config(config, system_prompt(config));
    info!(
        model = %agent_config.model,
        max_iterations = agent_config.max_iterations,
        timeout_secs = agent_config.timeout.as_secs(),
        "agent runtime ready"
    );
    let runtime = AgentRuntime::new(provider, tools, store, agent_config);
    Ok(Arc::new(MessageBus::new(Arc::new(runtime))))
}
