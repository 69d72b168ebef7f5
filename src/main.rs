//! Tiercache server
//!
//! Serves the tiered cache over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiercache::{create_router, AppState, Config, MemoryPersistentStore, PersistentStore, TieredCache};

/// Main entry point for the cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the durable tier (SQLite when `DATABASE_PATH` is set)
/// 4. Start the maintenance task
/// 5. Serve the router until SIGINT/SIGTERM, then close the cache
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiercache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tiercache server");

    let config = Config::from_env();
    info!(
        "Configuration loaded: max_memory={}B, default_ttl={}s, compression_threshold={}B, port={}",
        config.cache.max_memory_bytes,
        config.cache.default_ttl,
        config.cache.compression_threshold,
        config.server_port
    );

    let persistent = open_persistent(&config)?;
    let cache = TieredCache::new(config.cache.clone(), persistent);
    cache.start_maintenance().await;
    info!("Maintenance task started");

    let app = create_router(AppState::new(cache.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cache.close().await;
    info!("Server shutdown complete");
    Ok(())
}

#[cfg(feature = "sqlite")]
fn open_persistent(config: &Config) -> anyhow::Result<Arc<dyn PersistentStore>> {
    match &config.database_path {
        Some(path) => {
            let store = tiercache::SqliteStore::open(path)
                .with_context(|| format!("failed to open database at {}", path))?;
            info!("Durable tier: sqlite at {}", path);
            Ok(Arc::new(store))
        }
        None => {
            info!("Durable tier: in-process (DATABASE_PATH not set)");
            Ok(Arc::new(MemoryPersistentStore::new()))
        }
    }
}

#[cfg(not(feature = "sqlite"))]
fn open_persistent(config: &Config) -> anyhow::Result<Arc<dyn PersistentStore>> {
    if config.database_path.is_some() {
        tracing::warn!("DATABASE_PATH ignored: built without the sqlite feature");
    }
    info!("Durable tier: in-process");
    Ok(Arc::new(MemoryPersistentStore::new()))
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
