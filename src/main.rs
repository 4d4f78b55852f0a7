// =============================================================================
// Market Mirror — Main Entry Point
// =============================================================================
//
// Keeps a durable set of desired exchange subscriptions mirrored onto a live
// WebSocket session and serves the resulting ticker / candle cache over REST.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod engine;
mod error;
mod events;
mod exchange;
mod fallback;
mod health;
mod market_data;
mod reconciler;
mod registry;
mod runtime_config;
mod store;
mod stream;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::MarketMirror;
use crate::exchange::{MarketDataSource, OkxClient};
use crate::runtime_config::RuntimeConfig;
use crate::store::{FileStore, KvStore, MemoryStore};

const CONFIG_PATH: &str = "mirror_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Market Mirror — starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.default_symbols,
        intervals = ?config.default_candle_intervals,
        lanes = config.lanes,
        "configuration ready"
    );

    // ── 2. Collaborators ─────────────────────────────────────────────────
    let store: Arc<dyn KvStore> = match FileStore::open(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                path = %config.store_path,
                error = %e,
                "File store unavailable — registry will not survive restart"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let source: Arc<dyn MarketDataSource> = Arc::new(
        OkxClient::new(config.rest_base_url.clone(), config.request_timeout())
            .context("failed to build REST client")?,
    );

    // ── 3. Engine ────────────────────────────────────────────────────────
    let mirror = Arc::new(MarketMirror::new(&config, store, source));
    mirror
        .initialize()
        .await
        .context("market mirror initialisation failed")?;

    // ── 4. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let app = api::rest::router(mirror.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    server.abort();
    mirror.shutdown().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Market Mirror shut down complete.");
    Ok(())
}
