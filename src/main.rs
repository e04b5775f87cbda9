// =============================================================================
// Volatility Harvester — Main Entry Point
// =============================================================================
//
// Loads configuration and the static instrument/calendar references, then
// runs one trading session per calendar day until a shutdown signal arrives.
// =============================================================================

mod aggregator;
mod alert;
mod atr;
mod calendar;
mod checkpoint;
mod config;
mod feed_client;
mod gap_fill;
mod instrument_master;
mod orchestrator;
mod reconnect;
mod row_id;
mod store_client;
mod tick_buffer;
mod time_grid;
mod types;
mod write_pipeline;

use std::sync::atomic::Ordering;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::calendar::TradingCalendar;
use crate::config::EngineConfig;
use crate::instrument_master::InstrumentMaster;
use crate::orchestrator::Orchestrator;
use crate::store_client::StoreClient;

const ENGINE_CONFIG_PATH: &str = "config/engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("volatility harvester starting up");

    let config = EngineConfig::load(ENGINE_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, path = ENGINE_CONFIG_PATH, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    let instruments = InstrumentMaster::load(&config.instrument_master_path).unwrap_or_else(|e| {
        error!(error = %e, path = %config.instrument_master_path, "failed to load instrument master, starting with an empty set");
        InstrumentMaster::default()
    });
    if instruments.is_empty() {
        warn!("instrument master is empty — no instrument will be subscribed this run");
    }
    info!(count = instruments.len(), "instrument master loaded");

    let calendar = TradingCalendar::new(config.calendar_dir.clone());

    let store_api_key = std::env::var("STORE_API_KEY").unwrap_or_default();
    let store_api_secret = std::env::var("STORE_API_SECRET").unwrap_or_default();
    if store_api_key.is_empty() || store_api_secret.is_empty() {
        warn!("STORE_API_KEY / STORE_API_SECRET not set — store requests will fail signing checks");
    }
    let store = StoreClient::new(config.store_base_url.clone(), store_api_key, store_api_secret);

    let orchestrator = std::sync::Arc::new(Orchestrator::new(config, instruments, calendar, store));

    let stop = orchestrator.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received — stopping after the current boundary");
            stop.store(true, Ordering::Relaxed);
        }
    });

    loop {
        if orchestrator.stop_flag().load(Ordering::Relaxed) {
            break;
        }

        if let Err(e) = orchestrator.run().await {
            error!(error = %e, "session run ended with error");
        }

        if orchestrator.stop_flag().load(Ordering::Relaxed) {
            break;
        }

        info!("session ended, will re-check the calendar gate in an hour");
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }

    info!("volatility harvester shut down complete");
    Ok(())
}
