//! Lil Hal main binary.

mod config;
mod dialogue;
mod gateway;
mod init;
mod server;
mod voice;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "lilhal", version, about = "Lil Hal, a chat bot that knows when to be quiet")]
struct Cli {
    /// Config file. Defaults to ~/.lilhal/config.toml.
    #[arg(long, global = true, env = "LILHAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect and start listening (default).
    Serve,
    /// Initialize ~/.lilhal with a config template (idempotent).
    Init,
    /// Validate config and compile the phrase tables.
    Doctor,
    /// One-shot send to a Discord channel.
    Send { channel: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!(
                    "lilhal init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!("lilhal init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
            }
            println!("next: set DISCORD_BOT_TOKEN or edit {}", report.root.display());
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
        Command::Send { channel, message } => {
            server::send_one_shot(cli.config, &channel, &message).await
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "info,lilhal=debug,hal_app=debug,hal_engine=debug,hal_channels=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "unsupported LILHAL_LOG_FORMAT={other:?}; expected json, pretty or compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let format: LogFormat = std::env::var("LILHAL_LOG_FORMAT")
        .unwrap_or_default()
        .parse()?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => builder
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(?format, rust_log = ?std::env::var("RUST_LOG").ok(), "logging ready");
    Ok(())
}

/// Routes panics through tracing before the default hook prints them, so a
/// crash in a detached task still lands in structured logs.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map_or_else(|| "unknown".to_string(), |l| format!("{}:{}", l.file(), l.line()));
        let thread = std::thread::current();
        tracing::error!(
            thread = thread.name().unwrap_or("unnamed"),
            %location,
            message = panic_message(info.payload()),
            "lilhal panicked"
        );
        previous(info);
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
