//! Transfer Event Pool service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │ Gateway  │───▶│  Event Pool  │───▶│  Ledger  │
//! │  (HTTP)  │    │ (store+FSM)  │    │(executor)│
//! └──────────┘    └──────▲───────┘    └──────────┘
//!                        │ predicate results
//!                 ┌──────┴───────┐
//!                 │ Check runner │
//!                 └──────────────┘
//! ```
//!
//! Usage: `transfer_event_pool [--env dev] [--port 8080]`

use std::sync::Arc;

use anyhow::Context;

use transfer_event_pool::config::AppConfig;
use transfer_event_pool::db::{self, Database};
use transfer_event_pool::event_pool::{
    CheckRunner, EventPublisher, MemoryStore, PgTransferStore, TransferEventPool,
    TransferExecutor, TransferStore, event_channel,
};
use transfer_event_pool::gateway::{self, state::AppState};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[cfg(feature = "simulated-collaborators")]
fn collaborators(
    publisher: EventPublisher,
) -> anyhow::Result<(Arc<dyn CheckRunner>, Arc<dyn TransferExecutor>)> {
    use transfer_event_pool::event_pool::adapters::{RecordingExecutor, ScriptedCheckRunner};

    tracing::warn!("Using simulated check runner and ledger");
    Ok((
        Arc::new(ScriptedCheckRunner::new(publisher)),
        Arc::new(RecordingExecutor::new()),
    ))
}

#[cfg(not(feature = "simulated-collaborators"))]
fn collaborators(
    _publisher: EventPublisher,
) -> anyhow::Result<(Arc<dyn CheckRunner>, Arc<dyn TransferExecutor>)> {
    anyhow::bail!("no check runner or ledger adapter compiled in; enable `simulated-collaborators`")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = transfer_event_pool::logging::init_logging(&app_config)?;

    tracing::info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "Starting Transfer Event Pool"
    );

    let (store, pg_db): (Arc<dyn TransferStore>, Option<Arc<Database>>) =
        match &app_config.postgres_url {
            Some(url) => {
                let database = Database::connect(url, app_config.postgres_max_connections)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                db::run_migrations(database.pool()).await?;
                let store = PgTransferStore::new(database.pool().clone());
                (Arc::new(store), Some(Arc::new(database)))
            }
            None => {
                tracing::warn!("No postgres_url configured, pending transfers are kept in memory");
                (Arc::new(MemoryStore::new()), None)
            }
        };

    let (publisher, subscriber) = event_channel(app_config.pool.event_buffer);
    let (checks, executor) = collaborators(publisher)?;

    let pool = Arc::new(
        TransferEventPool::start(store, checks, executor, subscriber, app_config.pool.clone())
            .await?,
    );

    let port = get_port_override().unwrap_or(app_config.gateway.port);
    let state = Arc::new(AppState::new(pool.clone(), pg_db));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    let served = gateway::run_server(&app_config.gateway.host, port, state, shutdown).await;
    pool.shutdown().await;
    served
}
