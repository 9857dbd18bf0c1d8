use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use sealdrop::transfer::{start_deletion_worker, start_reaper};
use sealdrop::{BlobStore, Config, Database, LogNotifier, StaticDirectory, TransferService};

#[tokio::main]
async fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Initialize logging
    if let Err(e) = sealdrop::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        sealdrop::logging::init_console_only(&config.logging.level);
    }

    info!("Sealdrop - encrypted transfer backend");

    if let Err(e) = config.apply_env_overrides() {
        error!("Invalid environment override: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let db = match Database::open(&config.database.path).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let store = match BlobStore::new(&config.storage.path) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open blob store: {}", e);
            std::process::exit(1);
        }
    };

    let service = TransferService::new(
        &config,
        db.clone(),
        store,
        Arc::new(StaticDirectory::new()),
        Arc::new(LogNotifier),
    );

    match service.disk_metrics().await {
        Ok(metrics) => info!(
            "Storage: {} of {} bytes used ({} free)",
            metrics.used_bytes, metrics.quota_bytes, metrics.free_bytes
        ),
        Err(e) => warn!("Failed to read storage metrics: {}", e),
    }

    let worker = start_deletion_worker(service.scheduler().worker(&config.scheduler));
    let reaper = start_reaper(
        service.clone(),
        Duration::from_secs(config.reaper.interval_secs),
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    reaper.abort();
    worker.abort();
    db.close().await;
    info!("Sealdrop stopped");
}
