//! Nanoclaw - terminal chat and WebSocket gateway

use clap::{Parser, Subcommand, ValueEnum};
use nanoclaw_core::config::BindMode;
use nanoclaw_core::{ChannelIdentity, NanoclawConfig};
use nanoclaw_gateway::{anthropic_provider, build_bus, cli, open_store, start_gateway};
use nanoclaw_tools::format_session_list;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "nanoclaw", about = "Nanoclaw AI agent - terminal chat and gateway")]
struct Cli {
    /// Config file (default: ~/.nanoclaw/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Model to use
    #[arg(short, long, global = true)]
    model: Option<String>,
    /// Workspace directory holding AGENTS.md, SOUL.md, USER.md, TOOLS.md
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent in the terminal
    Chat {
        /// Session to open (created if missing)
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Start the WebSocket gateway
    Gateway {
        #[arg(short, long)]
        port: Option<u16>,
        /// loopback or lan
        #[arg(short, long)]
        bind: Option<String>,
        #[arg(short, long)]
        token: Option<String>,
    },
    /// List stored sessions for an identity
    Sessions {
        /// channel:chat_id
        #[arg(short, long, default_value = "cli:local")]
        identity: String,
    },
    /// Print the effective configuration
    Config,
    /// Show version
    Version,
}

/// Crate targets are underscored, so each one is listed.
const DEFAULT_LOG_FILTER: &str = "nanoclaw=info,nanoclaw_core=info,nanoclaw_llm=info,\
nanoclaw_tools=info,nanoclaw_agent=info,nanoclaw_gateway=info,tower_http=info";

/// Install the subscriber. The returned guard flushes the log file on drop.
fn init_logging(format: LogFormat, file: Option<&PathBuf>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let (writer, guard) = match file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("invalid log file: {}", path.display()))?;
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| ".".as_ref()), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
            None,
        ),
    };

    let layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(file.is_none())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(guard)
}

fn load_config(cli: &Cli) -> anyhow::Result<NanoclawConfig> {
    let mut config = match &cli.config {
        Some(path) => NanoclawConfig::load(path)?,
        None => NanoclawConfig::discover()?,
    };
    config.apply_env();
    if let Some(model) = &cli.model {
        config.agent.model = model.clone();
    }
    if let Some(ws) = &cli.workspace {
        config.agent.workspace = Some(ws.display().to_string());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_format, cli.log_file.as_ref())?;
    let mut config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Gateway { port, bind, token }) => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = match bind.as_str() {
                    "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                    _ => BindMode::Lan,
                };
            }
            if token.is_some() {
                config.gateway.token = token;
            }
            let bus = build_bus(&config, anthropic_provider(&config)?, open_store(&config)?)?;
            start_gateway(&config.gateway, bus).await?;
        }

        Some(Commands::Sessions { identity }) => {
            let identity: ChannelIdentity = identity.parse()?;
            let store = open_store(&config)?;
            let sessions = store.list(&identity).await;
            if sessions.is_empty() {
                println!("No sessions for {}", identity);
            } else {
                println!("{}", format_session_list(&sessions, sessions.len()));
            }
        }

        Some(Commands::Config) => {
            if config.provider.api_key.is_some() {
                config.provider.api_key = Some("<redacted>".into());
            }
            if config.gateway.token.is_some() {
                config.gateway.token = Some("<redacted>".into());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Some(Commands::Version) => {
            println!("nanoclaw v{}", env!("CARGO_PKG_VERSION"));
        }

        Some(Commands::Chat { session }) => run_chat(&config, session).await?,

        // No subcommand = chat
        None => run_chat(&config, None).await?,
    }

    Ok(())
}

async fn run_chat(config: &NanoclawConfig, session: Option<String>) -> anyhow::Result<()> {
    let bus = build_bus(config, anthropic_provider(config)?, open_store(config)?)?;
    cli::run_chat(bus, session).await
}
