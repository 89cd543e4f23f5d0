use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use icarus::config::Config;
use icarus::engine::{EngineConfig, JobEngine};
use icarus::gateway::{self, AppState};
use icarus::sandbox::DockerDriver;
use icarus::sentinel::Sentinel;
use icarus::store::{PostgresStore, Store};
use icarus::vcs::GitCli;
use icarus::workspace::WorkspaceManager;

/// ICARUS control plane: sandboxed build/check pipeline with a human
/// approval gate.
#[derive(Parser, Debug)]
#[command(name = "icarus", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "icarus.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // Store and container runtime are hard requirements; refuse to start
    // without them.
    let store = PostgresStore::connect(&config.store)
        .await
        .context("connecting to the store")?;
    store.migrate().await.context("running store migrations")?;
    let store: Arc<dyn Store> = Arc::new(store);

    let driver = Arc::new(
        DockerDriver::connect()
            .await
            .context("connecting to the container runtime")?,
    );
    for agent in [&config.agents.builder, &config.agents.checker] {
        driver
            .ensure_image(&agent.image_name, agent.auto_pull)
            .await
            .with_context(|| format!("preparing agent image {}", agent.image_name))?;
    }

    let sentinel = Arc::new(Sentinel::new(config.sentinel.clone(), driver.clone()));
    let engine = JobEngine::new(
        EngineConfig::from_config(&config),
        store.clone(),
        driver.clone(),
        Arc::new(GitCli),
        WorkspaceManager::new(&config.workspace),
        sentinel.subscribe(),
    );

    // Jobs that were mid-flight when the last process died are orphaned.
    engine.recover().await.context("startup recovery")?;

    tokio::spawn(Arc::clone(&sentinel).run());
    let scheduler = tokio::spawn(Arc::clone(&engine).run());

    let addr: SocketAddr = format!("{}:{}", config.orchestrator.host, config.orchestrator.port)
        .parse()
        .context("parsing gateway bind address")?;
    let state = AppState {
        engine: Arc::clone(&engine),
        store,
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(gateway::serve(state, addr, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    engine.shutdown().await;
    scheduler.abort();

    server
        .await
        .context("joining the gateway task")?
        .context("gateway server error")?;

    Ok(())
}
