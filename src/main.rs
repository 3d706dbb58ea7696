//! Oracle side-car binary
//!
//! Loads configuration and the market map, starts every provider plus the
//! aggregation ticker, and runs until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use oracle_sidecar::config::AppConfig;
use oracle_sidecar::marketmap::MarketMap;
use oracle_sidecar::oracle::Oracle;
use oracle_sidecar::orchestrator::ProviderOrchestrator;
use oracle_sidecar::providers::DefaultProviderFactory;
use oracle_sidecar::shutdown;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.oracle.log_json);
    info!(config = %config, "Configuration loaded");

    let market_map = MarketMap::load(&config.oracle.market_map_path)
        .with_context(|| {
            format!(
                "Failed to load market map from {}",
                config.oracle.market_map_path
            )
        })?;
    info!(markets = market_map.len(), "🗺️ Market map loaded");

    let orchestrator = Arc::new(ProviderOrchestrator::new(
        config.providers.clone(),
        market_map,
        Arc::new(DefaultProviderFactory::new()),
    )?);
    let oracle = Oracle::new(orchestrator.clone(), &config.oracle);

    let (trigger, signal) = shutdown::channel();
    oracle.start(&signal).await;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
                break;
            }
            _ = status.tick() => {
                let snapshot = oracle.get_prices();
                let providers = orchestrator.get_price_providers();
                info!(
                    prices = snapshot.len(),
                    providers = providers.len(),
                    "📊 Status"
                );
                for (name, provider) in providers.iter() {
                    let metrics = provider.metrics();
                    debug!(
                        provider = %name,
                        responses = metrics.responses,
                        resolved = metrics.resolved,
                        unresolved = metrics.unresolved,
                        reconnects = metrics.reconnects,
                        dropped_writes = metrics.dropped_writes,
                        "Provider metrics"
                    );
                }
            }
        }
    }

    trigger.shutdown();
    oracle.stop().await;
    info!("👋 Bye");
    Ok(())
}
