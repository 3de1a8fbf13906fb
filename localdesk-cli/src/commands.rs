//! Subcommand handlers.

use localdesk_core::{LifecycleEvent, Orchestrator, OrchestratorConfig};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{Commands, ConfigAction};

pub async fn handle_command(command: Commands, config: OrchestratorConfig) -> anyhow::Result<()> {
    match command {
        Commands::Up => up(config).await,
        Commands::Plan => plan(config),
        Commands::Health => health(config).await,
        Commands::Config { action } => handle_config(action, &config),
    }
}

async fn up(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    info!(
        data_dir = %orchestrator.paths().data_dir.display(),
        build_mode = %orchestrator.config().runtime.build_mode,
        "localdesk starting"
    );
    let forwarder = tokio::spawn(forward_events(orchestrator.events().subscribe()));

    let bootstrapper = orchestrator.bootstrapper();
    let quit_during_boot = tokio::select! {
        report = bootstrapper.launch() => {
            print_json(&report)?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("quit requested during boot");
            true
        }
    };

    if !quit_during_boot {
        info!("services launched, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("quit requested");
    }

    // Further Ctrl-C presses while stopping only hit the quit guard.
    let quit = orchestrator.shutdown();
    tokio::pin!(quit);
    loop {
        tokio::select! {
            _ = &mut quit => break,
            _ = tokio::signal::ctrl_c() => {
                let ran = orchestrator.shutdown().await;
                debug!(ran, "repeated quit request ignored");
            }
        }
    }

    forwarder.abort();
    Ok(())
}

async fn forward_events(mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => info!(
                channel = %event.channel(),
                alias = %event.alias,
                exit_code = ?event.exit_code,
                "lifecycle event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn plan(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let bootstrapper = orchestrator.bootstrapper();
    let settings = bootstrapper.load_settings();
    print_json(&bootstrapper.plan(&settings))
}

#[derive(Debug, Serialize)]
struct HealthReport {
    url: String,
    healthy: bool,
    access_key_present: bool,
}

async fn health(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let backend = orchestrator.backend();
    let report = HealthReport {
        url: backend.settings().runtime.base_url(),
        healthy: backend.probe_health().await,
        access_key_present: backend.access_key().await.is_some(),
    };
    print_json(&report)?;
    if !report.healthy {
        anyhow::bail!("backend at {} is not healthy", report.url);
    }
    Ok(())
}

fn handle_config(action: ConfigAction, config: &OrchestratorConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Path => match localdesk_core::config::user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no configuration directory on this platform"),
        },
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
