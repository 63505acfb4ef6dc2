// Back Office - Sync Server
// Live sync push channel + ledger API with Axum

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use back_office_sync::api::{router, AppState};
use back_office_sync::logging::init_logging;
use back_office_sync::resources::{LEDGER, PRODUCTS, SALES};
use back_office_sync::{JsonFileStore, LedgerEngine, SyncConfig, SyncEngine, VERSION};

#[derive(Parser, Debug)]
#[command(name = "back-office-server", version, about = "Back office live sync server")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    init_logging(&config.log_level)?;

    info!(version = VERSION, data_dir = ?config.data_dir, "🌐 Back office sync server starting");

    let store = Arc::new(
        JsonFileStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", config.data_dir))?,
    );

    // First run: the array resources start empty so they can be watched
    for name in [PRODUCTS, SALES, LEDGER] {
        if store.seed(name, &json!([]))? {
            info!(resource = name, "Seeded empty resource");
        }
    }

    let engine = Arc::new(SyncEngine::new(&config, store.clone()));
    engine.start().await.context("Failed to start sync engine")?;

    let state = AppState {
        engine: Arc::clone(&engine),
        ledger: Arc::new(LedgerEngine::new(store)),
        connection_timeout: config.connection_timeout(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    info!(bind = %config.bind, "🚀 Server running");
    info!("   Events: http://{}/api/sync/events", config.bind);
    info!("   Ledger: http://{}/api/depenses/mouvements", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await
        .context("Server error")
}

/// Waits for ctrl-c, then stops the engine so open event streams end
async fn shutdown_signal(engine: Arc<SyncEngine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    engine.stop().await;
}
