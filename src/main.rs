//! telecast-core - orchestration runtime for a 24/7 Telegram voice-chat
//! broadcasting platform: queueing, session recovery, worker supervision,
//! scheduling and rate limiting behind a single service facade.

use std::sync::Arc;

use telecast_core::config::Config;
use telecast_core::database;
use telecast_core::logging::init_logging;
use telecast_core::services::ServiceContainer;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let (logging_config, _guard) =
        init_logging(&log_dir).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    telecast_core::panic_hook::install(&log_dir);

    info!("Starting telecast-core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env_or_default();

    info!("Connecting to database: {}", config.relational_store_url);
    let pool = database::init_pool(&config.relational_store_url).await?;

    info!("Running database migrations...");
    database::run_migrations(&pool).await?;

    info!("Initializing services...");
    let container = Arc::new(ServiceContainer::new(config, pool).await?);

    logging_config.start_retention_cleanup(container.cancellation_token());

    container.start().await?;

    info!("telecast-core started successfully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down services...");
    container.shutdown().await;

    info!("telecast-core shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// Wait for SIGTERM signal (Windows - uses ctrl_c as fallback).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
