//! `auklet` command line tool.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use auklet_core::config::{
    Config, ConfigError, EventBusConfig, LoggingConfig, RequestConfig, VALID_LOG_LEVELS,
};
use auklet_core::logging::init_logging;
use clap::{Parser, Subcommand};
use tracing::info;

mod replay;

use replay::{ReplaySettings, replay};

/// Auklet - extensible XMPP client engine
#[derive(Parser)]
#[command(name = "auklet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a captured stanza script through the engine and print what it does
    Replay {
        /// Configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level: trace, debug, info, warn or error
        #[arg(long)]
        log_level: Option<String>,

        /// Cancel requests still pending at the end of the script
        #[arg(long)]
        disconnect: bool,

        /// Script with one stanza per line; `>>` marks outbound requests
        file: PathBuf,
    },
}

struct Settings {
    requests: RequestConfig,
    logging: LoggingConfig,
    event_bus: EventBusConfig,
}

fn load_settings(config: Option<PathBuf>, log_level: Option<String>) -> Result<Settings> {
    let mut settings = match config {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path }.into());
            }
            let config = Config::load(&path)?;
            Settings {
                requests: config.requests,
                logging: config.logging,
                event_bus: config.event_bus,
            }
        }
        None => Settings {
            requests: RequestConfig::default(),
            logging: LoggingConfig::default(),
            event_bus: EventBusConfig::default(),
        },
    };

    if let Some(level) = log_level {
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "invalid log level '{level}', expected one of {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }
        settings.logging.level = level;
    }
    Ok(settings)
}

async fn run_replay(
    config: Option<PathBuf>,
    log_level: Option<String>,
    disconnect: bool,
    file: PathBuf,
) -> Result<()> {
    let settings = load_settings(config, log_level)?;
    init_logging(&settings.logging)?;

    let script = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    info!(file = %file.display(), "replaying script");

    let report = replay(
        &script,
        &ReplaySettings {
            request_timeout: settings.requests.timeout(),
            sweep_interval: settings.requests.sweep_interval(),
            queue_capacity: settings.event_bus.channel_capacity,
            disconnect,
        },
    )
    .await?;

    for stanza in &report.outbound {
        println!("-> {stanza}");
    }
    for event in &report.events {
        println!("event {event}");
    }
    for (id, outcome) in &report.requests {
        println!("request {id}: {outcome}");
    }
    if report.timed_out > 0 {
        println!("timed out {} request(s)", report.timed_out);
    }
    if report.cancelled > 0 {
        println!("cancelled {} pending request(s)", report.cancelled);
    }
    if report.rejected_lines > 0 {
        println!("rejected {} line(s)", report.rejected_lines);
    }
    println!("features: {}", report.features.join(" "));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            config,
            log_level,
            disconnect,
            file,
        } => run_replay(config, log_level, disconnect, file).await,
    }
}
