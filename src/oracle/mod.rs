//! Oracle core - drives aggregation on a fixed cadence
//!
//! Owns the update-interval ticker. Every tick reads the orchestrator's live
//! runners and current market map, aggregates, and publishes a snapshot that
//! [`Oracle::get_prices`] hands out without blocking.

pub mod aggregator;

pub use aggregator::{AggregatedPrice, PathError, PriceAggregator, PriceSnapshot, ProviderPrices};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::marketmap::{MarketMap, MarketMapError};
use crate::orchestrator::{ProviderOrchestrator, ProviderTable};
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};

/// Snapshot of every live runner's cache.
pub fn collect_prices(table: &ProviderTable) -> ProviderPrices {
    table
        .iter()
        .map(|(name, provider)| (name.clone(), provider.latest_prices()))
        .collect()
}

struct TickTask {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

pub struct Oracle {
    orchestrator: Arc<ProviderOrchestrator>,
    aggregator: Arc<PriceAggregator>,
    update_interval: Duration,
    ticker: Mutex<Option<TickTask>>,
}

impl Oracle {
    pub fn new(orchestrator: Arc<ProviderOrchestrator>, config: &OracleConfig) -> Self {
        Self::with_intervals(orchestrator, config.update_interval(), config.max_price_age())
    }

    pub fn with_intervals(
        orchestrator: Arc<ProviderOrchestrator>,
        update_interval: Duration,
        max_price_age: Duration,
    ) -> Self {
        Self {
            orchestrator,
            aggregator: Arc::new(PriceAggregator::new(max_price_age)),
            update_interval,
            ticker: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ProviderOrchestrator> {
        &self.orchestrator
    }

    /// Starts the providers, then the aggregation ticker.
    pub async fn start(&self, shutdown: &ShutdownSignal) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return;
        }

        self.orchestrator.start(shutdown).await;

        let (trigger, signal) = shutdown.child();
        let handle = tokio::spawn(tick_loop(
            self.orchestrator.clone(),
            self.aggregator.clone(),
            self.update_interval,
            signal,
        ));
        *ticker = Some(TickTask { trigger, handle });
        info!(
            update_interval_ms = self.update_interval.as_millis() as u64,
            "📈 Oracle started"
        );
    }

    pub async fn stop(&self) {
        if let Some(task) = self.ticker.lock().await.take() {
            task.trigger.shutdown();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Aggregation task ended abnormally");
            }
        }
        self.orchestrator.stop().await;
        info!("Oracle stopped");
    }

    /// Latest published prices. A ticker without quorum is simply absent.
    pub fn get_prices(&self) -> Arc<PriceSnapshot> {
        self.aggregator.snapshot()
    }

    pub async fn update_market_map(&self, market_map: MarketMap) -> Result<(), MarketMapError> {
        self.orchestrator.update_market_map(market_map).await
    }

    /// Runs one aggregation pass immediately.
    pub fn tick(&self) -> Arc<PriceSnapshot> {
        run_tick(&self.orchestrator, &self.aggregator)
    }
}

fn run_tick(
    orchestrator: &ProviderOrchestrator,
    aggregator: &PriceAggregator,
) -> Arc<PriceSnapshot> {
    let map = orchestrator.market_map();
    let prices = collect_prices(&orchestrator.get_price_providers());
    aggregator.aggregate(&map, &prices, Utc::now())
}

async fn tick_loop(
    orchestrator: Arc<ProviderOrchestrator>,
    aggregator: Arc<PriceAggregator>,
    period: Duration,
    shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let map = orchestrator.market_map();
                let snapshot = run_tick(&orchestrator, &aggregator);
                debug!(
                    published = snapshot.len(),
                    markets = map.enabled_markets().count(),
                    "Aggregation tick"
                );
            }
        }
    }
}
