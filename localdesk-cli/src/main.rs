//! Localdesk CLI: headless host for the local inference services.
//!
//! Boots the backend and inference servers the way the desktop shell does,
//! forwards lifecycle events to the log and runs the quit sequence on Ctrl-C.

mod commands;

use clap::Parser;
use localdesk_core::{AppPaths, OrchestratorConfig};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Localdesk: local process orchestration for a desktop AI workspace
#[derive(Parser, Debug)]
#[command(name = "localdesk", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand (defaults to `up`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Boot the backend and inference services, stop them on Ctrl-C
    Up,
    /// Show what a boot would spawn, without spawning anything
    Plan,
    /// Probe the backend health endpoint once
    Health,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the user configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = localdesk_core::load_config(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer, including the backend's own output
    let log_dir = log_dir(&config)?;
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "localdesk.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command.unwrap_or(Commands::Up), config).await
}

/// Directory of the rolling JSON log, honouring `runtime.logs_dir` and
/// `runtime.data_dir`.
fn log_dir(config: &OrchestratorConfig) -> anyhow::Result<PathBuf> {
    Ok(AppPaths::resolve(config)?.logs_dir)
}
