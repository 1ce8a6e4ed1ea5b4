// =============================================================================
// Sentinel Core — Main Entry Point
// =============================================================================
//
// The engine starts in Paper mode unless the config explicitly selects Live
// and venue credentials are present in the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod bus;
mod config;
mod engine_state;
mod executor;
mod ledger;
mod market_data;
mod orchestrator;
mod persistence;
mod portfolio;
mod rebalance;
mod risk;
mod router;
mod signal;
mod stats;
mod types;
mod vacuum;
mod venue;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::SentinelConfig;
use crate::engine_state::EngineState;
use crate::persistence::StateStore;
use crate::types::EngineMode;
use crate::venue::binance::BinanceVenue;
use crate::venue::paper::PaperVenue;
use crate::venue::VenueAdapter;

const CONFIG_PATH: &str = "sentinel_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Sentinel Core — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = SentinelConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        SentinelConfig::default()
    });

    // Live mode requires credentials; anything else falls back to Paper.
    let api_key = std::env::var("SENTINEL_BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("SENTINEL_BINANCE_API_SECRET").unwrap_or_default();
    if config.engine_mode == EngineMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        warn!("Live mode requested without credentials, forcing Paper mode");
        config.engine_mode = EngineMode::Paper;
    }

    // Fail fast on nonsense before any task spawns.
    config.validate()?;

    info!(
        engine_mode = %config.engine_mode,
        pairs = config.pairs.len(),
        window_seconds = config.window_seconds,
        z_open = config.z_open,
        "configuration loaded"
    );

    // ── 2. Persistence & shared state ────────────────────────────────────
    let store = Arc::new(StateStore::new(config.data_dir.clone()));
    let state = Arc::new(EngineState::new(config.clone(), Some(store)));

    // ── 3. Venue adapters ────────────────────────────────────────────────
    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    match config.engine_mode {
        EngineMode::Live => {
            let binance = Arc::new(BinanceVenue::new(api_key, api_secret));
            venues.insert(binance.id().to_string(), binance);
        }
        EngineMode::Paper => {
            for spec in &config.pairs {
                venues.entry(spec.pair.venue.clone()).or_insert_with(|| {
                    Arc::new(PaperVenue::new(spec.pair.venue.clone())) as Arc<dyn VenueAdapter>
                });
            }
        }
    }
    info!(venues = venues.len(), "venue adapters constructed");

    // ── 4. Orchestrator: spawn every long-lived task ─────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    orchestrator::start(state.clone(), venues, shutdown_rx).await?;

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Give tasks a moment to flush their final snapshots.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Sentinel Core shut down complete.");
    Ok(())
}
