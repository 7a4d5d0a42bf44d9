use anyhow::Result;
use clap::Parser;
use foundry_core::{
    config::Config,
    daemon::{Daemon, DaemonSettings, Services},
    session::{AgentCliLauncher, SessionConfig, SessionManager},
    storage::{Database, ElementStore},
    worktree::WorktreeManager,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "foundry-daemon", about = "Agent orchestration daemon")]
struct Args {
    /// Override the database path from the environment.
    #[arg(long)]
    db_path: Option<String>,

    /// Run a single tick and exit instead of looping.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(db_path) = args.db_path {
        config.storage.db_path = db_path;
    }

    info!(db = %config.storage.db_path, "starting foundry daemon");

    let db = Database::open_and_migrate(config.storage.db_path.clone()).await?;
    let store = ElementStore::new(db);

    let worktrees = WorktreeManager::new(config.workspace.root.clone());
    worktrees.init_workspace().await?;

    let launcher = Arc::new(AgentCliLauncher::new(
        config.agent.binary.clone(),
        config.agent.base_args.clone(),
    ));
    let sessions = SessionManager::new(
        store.clone(),
        launcher,
        SessionConfig {
            handshake_timeout: Duration::from_millis(config.agent.handshake_timeout_ms),
            graceful_stop_timeout: Duration::from_millis(config.agent.graceful_stop_timeout_ms),
            default_working_directory: config.workspace.root.clone(),
        },
    );

    let services = Services::new(store, worktrees, sessions);
    let settings = DaemonSettings {
        tick_period: Duration::from_millis(config.daemon.tick_period_ms),
        max_session_duration: match config.daemon.max_session_duration_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
        task_retry_budget: config.daemon.task_retry_budget,
        gc_tick_interval: config.daemon.gc_tick_interval,
        gc_max_age_ms: config.daemon.gc_max_age_ms,
        base_ref: config.workspace.base_ref.clone(),
        shutdown_grace: Duration::from_millis(config.daemon.shutdown_grace_ms),
        ..DaemonSettings::default()
    };
    let daemon = Daemon::new(services, settings);

    if args.once {
        daemon.tick().await?;
        return Ok(());
    }

    daemon.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    if let Err(e) = daemon.stop().await {
        error!("shutdown failed: {e}");
    }

    Ok(())
}
