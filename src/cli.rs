//! `clap`-derived command-line entry: `run`, `check-config`, `migrate`,
//! `status`. Binary-boundary code; returns `anyhow::Result`, leaving typed
//! `Error`s to library code.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use crate::admin;
use crate::config::AppConfig;
use crate::poller::PollerCore;
use crate::store::Store;
use crate::telemetry;

#[derive(Debug, Parser)]
#[command(name = "reposentry", about = "Polls Git providers and dispatches CloudEvents to Tekton")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the poller and admin API; blocks until SIGINT/SIGTERM.
    Run {
        #[arg(long, env = "REPOSENTRY_CONFIG")]
        config: PathBuf,
        /// Emit logs as JSON instead of human-readable text.
        #[arg(long)]
        json_logs: bool,
        /// Directory for daily-rolling log files, in addition to stderr.
        #[arg(long, env = "REPOSENTRY_LOG_DIR")]
        log_dir: Option<PathBuf>,
    },
    /// Load and validate configuration, then exit. Touches neither the
    /// Store nor the network.
    CheckConfig {
        #[arg(long, env = "REPOSENTRY_CONFIG")]
        config: PathBuf,
    },
    /// Run pending migrations against the configured store and exit.
    Migrate {
        #[arg(long, env = "REPOSENTRY_CONFIG")]
        config: PathBuf,
    },
    /// One-shot: print per-repository baselines and pending event counts.
    Status {
        #[arg(long, env = "REPOSENTRY_CONFIG")]
        config: PathBuf,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run { config, json_logs, log_dir } => run_server(config, json_logs, log_dir).await,
        Command::CheckConfig { config } => check_config(config),
        Command::Migrate { config } => migrate(config).await,
        Command::Status { config } => status(config).await,
    }
}

async fn run_server(config_path: PathBuf, json_logs: bool, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    telemetry::init_tracing_with(json_logs, log_dir.as_deref());

    let cfg = AppConfig::load_from(&config_path).context("loading configuration")?;
    let store = Store::connect(
        &cfg.storage.path,
        cfg.storage.max_connections,
        cfg.storage.connection_timeout,
    )
    .await
    .context("opening store")?;

    let admin_addr = cfg.admin.listen_addr.clone();
    let (_tx, rx) = watch::channel(cfg);
    let poller = PollerCore::new(rx, store).context("constructing poller")?;
    poller.start().await.context("starting poller")?;

    let admin_poller = poller.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_poller, &admin_addr).await {
            tracing::error!(error = %e, "admin API server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping poller");
    poller.stop(std::time::Duration::from_secs(5)).await;
    admin_task.abort();

    Ok(())
}

fn check_config(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = AppConfig::load_from(&config_path).context("loading configuration")?;
    println!(
        "configuration valid: {} repositories, worker_count={}, event_listener_url={}",
        cfg.repositories.len(),
        cfg.polling.worker_count,
        cfg.dispatcher.event_listener_url
    );
    Ok(())
}

async fn migrate(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = AppConfig::load_from(&config_path).context("loading configuration")?;
    let store = Store::connect(
        &cfg.storage.path,
        cfg.storage.max_connections,
        cfg.storage.connection_timeout,
    )
    .await
    .context("opening store")?;
    store.migrate().await.context("running migrations")?;
    println!("migrations applied to {}", cfg.storage.path);
    Ok(())
}

async fn status(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = AppConfig::load_from(&config_path).context("loading configuration")?;
    let store = Store::connect(
        &cfg.storage.path,
        cfg.storage.max_connections,
        cfg.storage.connection_timeout,
    )
    .await
    .context("opening store")?;

    for repo in &cfg.repositories {
        let states = store.get_repo_states(&repo.name).await?;
        println!("{}: {} tracked branches", repo.name, states.len());
        for state in states {
            println!("  {} @ {}", state.branch, state.commit_sha);
        }
    }

    let counts = store.count_events_by_status().await?;
    println!("events: {counts:?}");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
