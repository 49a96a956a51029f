// =============================================================================
// Meridian Trading Core — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode for safety. Live trading must be
// enabled explicitly in the runtime config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app;
mod balance;
mod bus;
mod config;
mod errors;
mod execution;
mod gateway;
mod indicators;
mod market_data;
mod position;
mod reconcile;
mod risk;
mod service;
mod store;
mod strategy;
mod types;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::CoreConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Trading Core starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());
    let mut config = CoreConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        CoreConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        let parsed: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            config.symbols = parsed;
        }
    }

    info!(
        symbols = ?config.symbols,
        dry_run = config.dry_run,
        "configured trading pairs"
    );

    // ── 2. Build and start the engine ────────────────────────────────────
    let app = App::bootstrap(config)?;
    let root_token = CancellationToken::new();
    app.start(root_token.clone()).await?;

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    root_token.cancel();
    app.shutdown().await;

    if let Err(e) = app.config.save(&config_path) {
        warn!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian Trading Core shut down complete.");
    Ok(())
}
