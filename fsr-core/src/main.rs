//! fsr-core - Field survey response server
//!
//! Accepts two-phase sync from field devices, gates every status change
//! through the lifecycle state machine, verifies audio evidence against
//! object storage and runs QC batches.

use anyhow::Result;
use clap::Parser;
use fsr_common::config::{load_module_config, RootFolderInitializer, RootFolderResolver};
use fsr_common::events::EventBus;
use fsr_core::services::survey_catalog::CATALOG_FILE;
use fsr_core::services::{FsObjectStore, PermissiveCatalog, StaticCatalog, SurveyCatalog};
use fsr_core::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MODULE_NAME: &str = "fsr-core";

#[derive(Debug, Parser)]
#[command(name = "fsr-core", version, about = "Field survey response server")]
struct Args {
    /// Root folder holding fsr.db and objects/
    #[arg(long, env = "FSR_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Address to bind (overrides [server].bind_address)
    #[arg(long, env = "FSR_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(long, env = "FSR_PORT")]
    port: Option<u16>,

    /// Seconds between QC sweeps, 0 disables the sweeper
    #[arg(long, env = "FSR_QC_SWEEP_SECS")]
    qc_sweep_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_module_config(MODULE_NAME);

    // RUST_LOG wins over the config file level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        "Starting fsr-core v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Step 1: Resolve root folder
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .resolve();

    // Step 2: Create root folder directory if missing
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", initializer.root_folder().display());

    // Step 3: Open or create database
    let db_path = initializer.database_path();
    let db_pool = fsr_core::db::init_database(&db_path).await?;
    info!("Database: {}", db_path.display());

    let store = Arc::new(FsObjectStore::new(initializer.objects_path()));
    info!("Object store: {}", initializer.objects_path().display());

    let catalog_path = initializer.root_folder().join(CATALOG_FILE);
    let catalog: Arc<dyn SurveyCatalog> = if catalog_path.exists() {
        let catalog = StaticCatalog::load(&catalog_path)?;
        info!(
            "Survey catalog: {} ({} surveys)",
            catalog_path.display(),
            catalog.survey_count()
        );
        Arc::new(catalog)
    } else {
        warn!("No survey catalog at {}, accepting any survey", catalog_path.display());
        Arc::new(PermissiveCatalog)
    };

    let event_bus = EventBus::new(256);
    let state = AppState::new(db_pool, event_bus, store, catalog, &config);

    let cancel = CancellationToken::new();
    let sweep_secs = args.qc_sweep_secs.unwrap_or(config.qc.sweep_interval_secs);
    let sweeper = if sweep_secs > 0 {
        info!("QC sweeper every {}s", sweep_secs);
        Some(
            state
                .qc
                .clone()
                .spawn_sweeper(Duration::from_secs(sweep_secs), cancel.clone()),
        )
    } else {
        None
    };

    let app = fsr_core::build_router(state);

    let bind_address = args
        .bind_address
        .unwrap_or_else(|| config.server.bind_address.clone());
    let port = args.port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind((bind_address.as_str(), port)).await?;
    info!("Listening on http://{}:{}", bind_address, port);
    info!("Health check: http://{}:{}/health", bind_address, port);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    info!("fsr-core stopped");
    Ok(())
}
