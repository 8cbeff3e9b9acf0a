//! Nanoclaw config - serde structs for ~/.nanoclaw/config.json
//!
//! Pure types and parsing only. Values are read once at startup and handed to
//! the runtime and session store as read-only parameters.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NanoclawConfig {
    pub agent: AgentSection,
    pub sessions: SessionsSection,
    pub provider: ProviderSection,
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSection {
    pub model: String,
    pub max_iterations: usize,
    pub timeout_secs: u64,
    pub context_tokens: usize,
    pub max_tokens: u32,
    pub max_tool_result_chars: usize,
    pub system_prompt: Option<String>,
    pub workspace: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_iterations: 20,
            timeout_secs: 300,
            context_tokens: 64_000,
            max_tokens: 8192,
            max_tool_result_chars: 16_000,
            system_prompt: None,
            workspace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub dir: Option<String>,
    pub persist: bool,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            dir: None,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub port: u16,
    pub bind: BindMode,
    pub token: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: 18790,
            bind: BindMode::default(),
            token: None,
        }
    }
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

/// Files loaded from the workspace and injected into the system prompt.
pub const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md"];

impl NanoclawConfig {
    /// Load from a specific path. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Discover from ~/.nanoclaw/config.json.
    pub fn discover() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// Default path: ~/.nanoclaw/config.json
    pub fn default_path() -> PathBuf {
        home_dir().join(".nanoclaw").join("config.json")
    }

    /// Apply NANOCLAW_* and ANTHROPIC_API_KEY environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("NANOCLAW_MODEL") {
            self.agent.model = model;
        }
        if let Some(ws) = lookup("NANOCLAW_WORKSPACE") {
            self.agent.workspace = Some(ws);
        }
        if let Some(token) = lookup("NANOCLAW_GATEWAY_TOKEN") {
            self.gateway.token = Some(token);
        }
        if self.provider.api_key.is_none() {
            self.provider.api_key = lookup("ANTHROPIC_API_KEY");
        }
    }

    /// Workspace from config, or ~/.nanoclaw/workspace
    pub fn workspace(&self) -> PathBuf {
        self.agent
            .workspace
            .as_ref()
            .map(|w| expand_tilde(w))
            .unwrap_or_else(|| home_dir().join(".nanoclaw").join("workspace"))
    }

    /// Session directory, or None when persistence is turned off.
    pub fn sessions_dir(&self) -> Option<PathBuf> {
        if !self.sessions.persist {
            return None;
        }
        Some(
            self.sessions
                .dir
                .as_ref()
                .map(|d| expand_tilde(d))
                .unwrap_or_else(|| home_dir().join(".nanoclaw").join("sessions")),
        )
    }

    /// Where the message tool drops decoded attachments.
    pub fn media_dir(&self) -> PathBuf {
        home_dir().join(".nanoclaw").join("media")
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(Error::Config("agent.maxIterations must be at least 1".into()));
        }
        if self.agent.timeout_secs == 0 {
            return Err(Error::Config("agent.timeoutSecs must be at least 1".into()));
        }
        if self.agent.model.trim().is_empty() {
            return Err(Error::Config("agent.model must not be empty".into()));
        }
        Ok(())
    }
}

/// Load bootstrap identity files from the workspace.
pub fn load_bootstrap_files(workspace: &Path) -> Vec<(String, String)> {
    let mut files = Vec::new();
    for name in BOOTSTRAP_FILES {
        if let Ok(content) = std::fs::read_to_string(workspace.join(name)) {
            if !content.trim().is_empty() {
                files.push((name.to_string(), content));
            }
        }
    }
    files
}

/// Format bootstrap files into a system prompt section.
pub fn bootstrap_to_system_prompt(files: &[(String, String)]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let mut prompt = String::from("# Workspace Context\n\n");
    for (name, content) in files {
        prompt.push_str(&format!("## {}\n\n{}\n\n", name, content.trim()));
    }
    Some(prompt)
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(path)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}
