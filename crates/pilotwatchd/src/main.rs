//! pilotwatchd: the deployment-group health watcher daemon.
//!
//! Assembles the watcher from:
//! - State store (redb)
//! - Topology source (control plane or a local topology file)
//! - Sidecar status client
//!
//! # Usage
//!
//! ```text
//! pilotwatchd run --config /etc/pilotwatch/pilotwatchd.toml
//! pilotwatchd check --topology topology.toml
//! ```

mod config;
mod control_plane;
mod topology;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use pilotwatch_health::{
    Collaborators, DiscoverySource, MachineDirectory, WatchEvents, Watcher,
};
use pilotwatch_state::{DeploymentGroup, Health, StateStore};

use crate::config::DaemonConfig;
use crate::control_plane::ControlPlaneClient;
use crate::topology::FileTopology;

#[derive(Parser)]
#[command(name = "pilotwatchd", about = "Deployment-group health watcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch continuously until interrupted.
    Run(Overrides),
    /// Run a single watch cycle and print the reconciled topology as JSON.
    Check(Overrides),
}

#[derive(Args)]
struct Overrides {
    /// Path to pilotwatchd.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delay between watch cycles, in milliseconds.
    #[arg(long)]
    frequency_ms: Option<u64>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Read the topology from this file instead of the control plane.
    #[arg(long)]
    topology: Option<PathBuf>,
}

impl Overrides {
    fn resolve(self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::load(self.config.as_deref())?;
        if let Some(frequency_ms) = self.frequency_ms {
            config.frequency_ms = frequency_ms;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if self.topology.is_some() {
            config.topology = self.topology;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pilotwatchd=debug,pilotwatch_health=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(overrides) => run(overrides.resolve()?).await,
        Command::Check(overrides) => check(overrides.resolve()?).await,
    }
}

fn build_watcher(config: &DaemonConfig) -> anyhow::Result<(Watcher, WatchEvents)> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let db_path = config.data_dir.join("pilotwatch.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (discovery, machines): (Arc<dyn DiscoverySource>, Arc<dyn MachineDirectory>) =
        match &config.topology {
            Some(path) => {
                info!(path = ?path, "using topology file");
                let topology = Arc::new(FileTopology::new(path));
                (topology.clone(), topology)
            }
            None => {
                info!("using control plane");
                let client = Arc::new(ControlPlaneClient::new(
                    &config.control_plane,
                    config.status_timeout(),
                ));
                (client.clone(), client)
            }
        };

    Ok(Watcher::new(
        config.watcher_config(),
        Collaborators {
            discovery,
            machines,
            status: Arc::new(config.status_client()),
            sink: Arc::new(store),
        },
    ))
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(frequency_ms = config.frequency_ms, "pilotwatchd starting");
    let (watcher, mut events) = build_watcher(&config)?;
    watcher.start();

    loop {
        tokio::select! {
            Some(groups) = events.results.recv() => log_summary(&groups),
            Some(err) = events.errors.recv() => debug!(error = %err, "watch error"),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }

    watcher.stop().await;
    info!("pilotwatchd stopped");
    Ok(())
}

async fn check(config: DaemonConfig) -> anyhow::Result<()> {
    let (watcher, _events) = build_watcher(&config)?;
    let groups = watcher
        .check()
        .await
        .context("watch cycle failed, see log for details")?;
    println!("{}", serde_json::to_string_pretty(&groups)?);
    Ok(())
}

fn log_summary(groups: &[DeploymentGroup]) {
    let instances: Vec<_> = groups
        .iter()
        .flat_map(|g| g.services.iter())
        .flat_map(|s| s.instances.iter())
        .collect();
    let unavailable = instances
        .iter()
        .filter(|i| i.healthy == Health::Unavailable)
        .count();

    info!(
        groups = groups.len(),
        instances = instances.len(),
        unavailable,
        "watch cycle complete"
    );
}
