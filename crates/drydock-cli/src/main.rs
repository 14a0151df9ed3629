//! Drydock - Deployment Orchestrator
//!
//! Usage:
//!   drydock daemon            # Periodic triggers + run promotion
//!   drydock run <target>      # Deploy one target now and wait
//!   drydock targets           # List configured targets

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use drydock_core::prelude::*;

#[derive(Parser)]
#[command(name = "drydock")]
#[command(about = "Deployment orchestrator", long_about = None)]
struct Cli {
    /// Application configuration file
    #[arg(long, default_value = "drydock.toml")]
    config: PathBuf,

    /// Deployment target definitions
    #[arg(long, default_value = "targets.toml")]
    targets: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator daemon
    Daemon,

    /// Deploy one target now and wait for the outcome
    Run {
        /// Target name as configured in the targets file
        name: String,

        /// Print the finished run as JSON instead of a summary
        #[arg(short, long)]
        json: bool,
    },

    /// List configured targets
    Targets {
        /// Machine-readable output
        #[arg(short, long)]
        json: bool,
    },
}

/// Targets file: a list of `[[target]]` tables.
#[derive(Deserialize)]
struct TargetsFile {
    #[serde(default)]
    target: Vec<TargetEntry>,
}

#[derive(Deserialize)]
struct TargetEntry {
    name: String,
    numero: String,
    repository_url: Url,
    #[serde(default)]
    snapshot: bool,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    servers: Vec<ServerSpec>,
    #[serde(default)]
    notify: NotifySettings,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drydock=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let app = Arc::new(AppConfig::load(&cli.config)?);
    let store = Arc::new(MemoryStore::new());
    load_targets(&cli.targets, &store).await?;

    match cli.command {
        Commands::Daemon => run_daemon(app, store).await,
        Commands::Run { name, json } => run_once(app, store, &name, json).await,
        Commands::Targets { json } => list_targets(store, json).await,
    }
}

fn build_scheduler(app: Arc<AppConfig>, store: Arc<MemoryStore>) -> Result<Arc<Scheduler>> {
    let fetch = Arc::new(ProxyPool::new(&app.proxies)?);
    let runtime = Arc::new(DockerRuntime::new(&app));
    Ok(Scheduler::new(
        app,
        store.clone(),
        store,
        fetch,
        runtime,
        Arc::new(NullSink),
        Arc::new(LogNotifier),
    ))
}

async fn run_daemon(app: Arc<AppConfig>, store: Arc<MemoryStore>) -> Result<()> {
    let scheduler = build_scheduler(app, store)?;
    scheduler.init_triggers().await?;
    tracing::info!("drydock daemon started");
    scheduler.run_promote_loop().await;
    Ok(())
}

async fn run_once(
    app: Arc<AppConfig>,
    store: Arc<MemoryStore>,
    name: &str,
    json: bool,
) -> Result<()> {
    let config = find_target(&store, name).await?;
    let scheduler = build_scheduler(app, store)?;

    let requested = scheduler.request_run(config.id).await?;
    scheduler.promote_next().await?;
    let run = scheduler.get_run(requested.run.id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&config, &run);
    }
    if run.status == RunStatus::Failed {
        bail!("deployment of '{}' failed", config.full_name());
    }
    Ok(())
}

async fn list_targets(store: Arc<MemoryStore>, json: bool) -> Result<()> {
    let configs = ConfigStore::list(&*store).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }
    for config in configs {
        let state = if config.paused { " (paused)" } else { "" };
        println!("{}{state}", config.full_name());
        for server in &config.servers {
            println!("  {} [{}]", server.name, server.artifacts.join(", "));
        }
    }
    Ok(())
}

fn print_run(config: &TargetConfig, run: &Run) {
    println!("{}: {:?}", config.full_name(), run.status);
    for server in &run.servers {
        println!("  {}: {:?}", server.name, server.status);
        for artifact in &server.artifacts {
            println!("    {}: {:?}", artifact.name, artifact.status);
        }
    }
}

async fn find_target(store: &Arc<MemoryStore>, name: &str) -> Result<TargetConfig> {
    let configs = ConfigStore::list(&**store).await?;
    configs
        .into_iter()
        .find(|c| c.name == name)
        .with_context(|| format!("no target named '{name}'"))
}

/// Seed the configuration store from the targets file, when it exists.
async fn load_targets(path: &Path, store: &Arc<MemoryStore>) -> Result<()> {
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "no targets file, starting empty");
        return Ok(());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file '{}'", path.display()))?;
    let file: TargetsFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse targets file '{}'", path.display()))?;

    for entry in file.target {
        let mut config = TargetConfig::new(entry.name, entry.numero, entry.repository_url);
        config.snapshot = entry.snapshot;
        config.paused = entry.paused;
        config.servers = entry.servers;
        config.notify = entry.notify;
        ConfigStore::create(&**store, config).await?;
    }
    Ok(())
}
