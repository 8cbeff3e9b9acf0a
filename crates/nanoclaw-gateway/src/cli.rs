//! Terminal chat: the `cli` channel adapter plus slash commands

use nanoclaw_agent::{ChannelAdapter, MessageBus, SessionStore};
use nanoclaw_core::{ChannelIdentity, InboundMessage, NewSession, Outbound, Result};
use nanoclaw_tools::format_session_list;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

pub const CLI_CHANNEL: &str = "cli";

/// The identity every terminal conversation runs under.
pub fn cli_identity() -> ChannelIdentity {
    ChannelIdentity::new(CLI_CHANNEL, "local")
}

/// Prints outbound traffic to stdout.
pub struct CliChannel;

#[async_trait::async_trait]
impl ChannelAdapter for CliChannel {
    fn name(&self) -> &str {
        CLI_CHANNEL
    }

    async fn deliver(&self, outbound: &Outbound) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", render_outbound(outbound))?;
        stdout.flush()?;
        Ok(())
    }
}

pub fn render_outbound(outbound: &Outbound) -> String {
    match outbound {
        Outbound::ToolCall(n) => format!("  {}", n.summary),
        Outbound::Message(m) => {
            let mut out = String::new();
            if let Some(title) = &m.title {
                out.push_str(&format!("## {}\n", title));
            }
            out.push_str(&m.text);
            for path in &m.media {
                out.push_str(&format!("\n  [media: {}]", path));
            }
            out
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New(Option<String>),
    Switch(String),
    Sessions,
    Reset,
    Current,
    Help,
    Quit,
}

/// Parse a slash command. `None` means the line is a chat message.
pub fn parse_command(line: &str) -> Option<std::result::Result<Command, String>> {
    let line = line.trim();
    let rest = line.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let cmd = match name {
        "new" => Ok(Command::New((!arg.is_empty()).then(|| arg.to_string()))),
        "switch" if arg.is_empty() => Err("usage: /switch <key>".to_string()),
        "switch" => Ok(Command::Switch(arg.to_string())),
        "sessions" => Ok(Command::Sessions),
        "reset" => Ok(Command::Reset),
        "current" => Ok(Command::Current),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command: /{} (try /help)", other)),
    };
    Some(cmd)
}

const HELP: &str = "\
/new [title]    start a new session and switch to it
/switch <key>   switch to an existing session
/sessions       list sessions (* marks the active one)
/reset          go back to the default session
/current        show the active session
/quit           leave";

/// Run a command against the store and return the text to show.
pub async fn run_command(
    store: &SessionStore,
    identity: &ChannelIdentity,
    cmd: Command,
) -> Result<String> {
    match cmd {
        Command::New(title) => {
            let created = store
                .create(
                    identity,
                    NewSession {
                        title,
                        ..Default::default()
                    },
                )
                .await?;
            let s = store.switch(identity, created.key.as_str()).await?;
            Ok(format!("Switched to new session {} ({})", s.key, s.title))
        }
        Command::Switch(key) => {
            let s = store.switch(identity, &key).await?;
            Ok(format!("Switched to {} ({})", s.key, s.title))
        }
        Command::Sessions => {
            let sessions = store.list(identity).await;
            if sessions.is_empty() {
                Ok("No sessions yet.".to_string())
            } else {
                Ok(format_session_list(&sessions, sessions.len()))
            }
        }
        Command::Reset => {
            store.reset(identity).await?;
            Ok(format!(
                "Back to the default session {}",
                identity.default_session_key()
            ))
        }
        Command::Current => Ok(match store.current(identity).await {
            Some(s) => format!("Active session: {} ({})", s.key, s.title),
            None => format!(
                "Using the default session {}",
                identity.default_session_key()
            ),
        }),
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
    }
}

/// Interactive loop over stdin. Ctrl-C aborts the running turn; `/quit` or EOF leaves.
pub async fn run_chat(bus: Arc<MessageBus>, session: Option<String>) -> anyhow::Result<()> {
    bus.register_channel(Arc::new(CliChannel));
    let identity = cli_identity();
    let store = bus.runtime().sessions().clone();

    if let Some(name) = session {
        let request = NewSession {
            key: Some(name),
            allow_existing: true,
            ..Default::default()
        };
        let created = store.create(&identity, request).await?;
        store.switch(&identity, created.key.as_str()).await?;
    }

    let active = store.resolve_active_key(&identity).await?;
    println!(
        "nanoclaw v{} | model {} | session {}",
        env!("CARGO_PKG_VERSION"),
        bus.runtime().config().model,
        active
    );
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Some(Ok(Command::Quit)) => break,
            Some(Ok(cmd)) => match run_command(&store, &identity, cmd).await {
                Ok(text) => println!("{}", text),
                Err(e) => println!("error: {}", e),
            },
            Some(Err(usage)) => println!("{}", usage),
            None => {
                let mut turn = bus.dispatch(InboundMessage::new(identity.clone(), line));
                let joined = tokio::select! {
                    joined = &mut turn => joined,
                    _ = tokio::signal::ctrl_c() => {
                        bus.abort(&identity);
                        println!("\n[aborting]");
                        turn.await
                    }
                };
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => println!("error: {}", e),
                    Err(e) => warn!("turn task failed: {}", e),
                }
            }
        }
    }
    Ok(())
}
