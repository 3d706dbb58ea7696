//! Provider orchestrator
//!
//! Keeps one runner per enabled provider in sync with the market map:
//! - a provider's ticker assignment is derived from the map
//! - on a map update only providers whose assignment changed are restarted
//! - providers left without tickers are stopped
//!
//! Transitions for one provider are serialized by that provider's slot lock.
//! The market map and the live provider table are swapped wholesale, so
//! readers never wait on a restart.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::marketmap::{MarketMap, MarketMapError};
use crate::providers::{PriceProvider, ProviderFactory};
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::types::ProviderTicker;

/// Runners currently serving prices, keyed by provider name.
pub type ProviderTable = HashMap<String, Arc<dyn PriceProvider>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderState::Stopped => "stopped",
            ProviderState::Starting => "starting",
            ProviderState::Running => "running",
            ProviderState::Stopping => "stopping",
        };
        write!(f, "{}", label)
    }
}

#[derive(Default)]
struct SlotInner {
    runner: Option<Arc<dyn PriceProvider>>,
    tickers: BTreeSet<ProviderTicker>,
}

struct ProviderSlot {
    config: ProviderConfig,
    state: RwLock<ProviderState>,
    inner: Mutex<SlotInner>,
}

impl ProviderSlot {
    fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ProviderState::Stopped),
            inner: Mutex::new(SlotInner::default()),
        }
    }

    fn state(&self) -> ProviderState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ProviderState) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = std::mem::replace(&mut *state, next);
        debug!(provider = %self.config.name, from = %from, to = %next, "Provider state transition");
    }
}

struct Lifecycle {
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
}

pub struct ProviderOrchestrator {
    factory: Arc<dyn ProviderFactory>,
    slots: BTreeMap<String, Arc<ProviderSlot>>,
    known: HashSet<String>,
    market_map: RwLock<Arc<MarketMap>>,
    live: RwLock<Arc<ProviderTable>>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl ProviderOrchestrator {
    /// `providers` is the full configured list; disabled providers are known
    /// to the market map validation but never run.
    pub fn new(
        providers: Vec<ProviderConfig>,
        market_map: MarketMap,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self> {
        let known: HashSet<String> = providers.iter().map(|p| p.name.clone()).collect();
        let mut slots = BTreeMap::new();
        for config in providers.into_iter().filter(|p| p.enabled) {
            factory
                .supports(&config)
                .with_context(|| format!("provider {} cannot be built", config.name))?;
            slots.insert(config.name.clone(), Arc::new(ProviderSlot::new(config)));
        }
        market_map
            .validate_providers(&known)
            .context("market map references an unconfigured provider")?;

        Ok(Self {
            factory,
            slots,
            known,
            market_map: RwLock::new(Arc::new(market_map)),
            live: RwLock::new(Arc::new(ProviderTable::new())),
            lifecycle: Mutex::new(None),
        })
    }

    /// Launches every provider that has tickers. Returns once each one has
    /// made its first start attempt. Calling it again while running is a no-op.
    pub async fn start(&self, shutdown: &ShutdownSignal) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return;
        }
        let (trigger, signal) = shutdown.child();
        let map = self.market_map();
        info!(providers = self.slots.len(), markets = map.len(), "🚀 Starting providers");

        self.reconcile_all(&map, &signal).await;
        *lifecycle = Some(Lifecycle { trigger, signal });
    }

    /// Stops every runner and waits for all of them to exit.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };
        running.trigger.shutdown();

        join_all(
            self.slots
                .values()
                .map(|slot| self.reconcile_slot(slot, BTreeSet::new(), &running.signal)),
        )
        .await;
        self.rebuild_live().await;
        info!("🛑 All providers stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Replaces the market map and restarts only the providers whose ticker
    /// assignment changed. A rejected map leaves everything untouched.
    pub async fn update_market_map(&self, market_map: MarketMap) -> Result<(), MarketMapError> {
        if let Err(e) = market_map.validate_providers(&self.known) {
            warn!(error = %e, "Rejected market map update");
            return Err(e);
        }

        let lifecycle = self.lifecycle.lock().await;
        let map = Arc::new(market_map);
        self.swap_market_map(map.clone());

        if let Some(running) = lifecycle.as_ref() {
            self.reconcile_all(&map, &running.signal).await;
        }
        info!(markets = map.len(), "🗺️ Market map applied");
        Ok(())
    }

    /// The live runner table. Cheap to call; the returned table never changes.
    pub fn get_price_providers(&self) -> Arc<ProviderTable> {
        match self.live.read() {
            Ok(live) => live.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn market_map(&self) -> Arc<MarketMap> {
        match self.market_map.read() {
            Ok(map) => map.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn provider_state(&self, name: &str) -> Option<ProviderState> {
        self.slots.get(name).map(|slot| slot.state())
    }

    /// Tickers the provider is currently assigned.
    pub async fn provider_tickers(&self, name: &str) -> Option<BTreeSet<ProviderTicker>> {
        let slot = self.slots.get(name)?;
        let inner = slot.inner.lock().await;
        Some(inner.tickers.clone())
    }

    fn swap_market_map(&self, map: Arc<MarketMap>) {
        let mut current = match self.market_map.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = map;
    }

    async fn reconcile_all(&self, map: &MarketMap, signal: &ShutdownSignal) {
        join_all(self.slots.iter().map(|(name, slot)| {
            let desired = map.provider_tickers(name);
            self.reconcile_slot(slot, desired, signal)
        }))
        .await;
        self.rebuild_live().await;
    }

    /// Brings one provider to `desired`. Unchanged assignments on a healthy
    /// runner are left alone.
    async fn reconcile_slot(
        &self,
        slot: &ProviderSlot,
        desired: BTreeSet<ProviderTicker>,
        signal: &ShutdownSignal,
    ) {
        let name = slot.config.name.as_str();
        let mut inner = slot.inner.lock().await;

        let healthy = inner.runner.as_ref().map_or(false, |r| r.is_running());
        if inner.tickers == desired && (healthy || desired.is_empty()) {
            debug!(provider = %name, "Ticker assignment unchanged");
            return;
        }

        if let Some(runner) = inner.runner.take() {
            slot.set_state(ProviderState::Stopping);
            runner.stop().await;
            info!(provider = %name, "Provider runner stopped");
        }
        slot.set_state(ProviderState::Stopped);
        inner.tickers = desired.clone();

        if desired.is_empty() || signal.is_shutdown() {
            return;
        }

        slot.set_state(ProviderState::Starting);
        let runner = match self.factory.build(&slot.config, desired.into_iter().collect()) {
            Ok(runner) => runner,
            Err(e) => {
                error!(provider = %name, error = %e, "Failed to build provider");
                slot.set_state(ProviderState::Stopped);
                return;
            }
        };
        match runner.start(signal.clone()).await {
            Ok(()) => {
                info!(provider = %name, tickers = inner.tickers.len(), "Provider runner started");
                inner.runner = Some(runner);
                slot.set_state(ProviderState::Running);
            }
            Err(e) => {
                error!(provider = %name, error = %e, "Failed to start provider");
                slot.set_state(ProviderState::Stopped);
            }
        }
    }

    async fn rebuild_live(&self) {
        let mut table = ProviderTable::new();
        for (name, slot) in &self.slots {
            if let Some(runner) = slot.inner.lock().await.runner.clone() {
                table.insert(name.clone(), runner);
            }
        }
        let mut live = match self.live.write() {
            Ok(live) => live,
            Err(poisoned) => poisoned.into_inner(),
        };
        *live = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ProviderKind};
    use crate::marketmap::tests::direct_market;
    use crate::providers::{MetricsSnapshot, ProviderError, ProviderResult};
    use crate::shutdown;
    use crate::types::PriceResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Counters {
        starts: HashMap<String, usize>,
        stops: HashMap<String, usize>,
    }

    type SharedCounters = Arc<StdMutex<Counters>>;

    struct FakeProvider {
        name: String,
        tickers: Vec<ProviderTicker>,
        running: AtomicBool,
        counters: SharedCounters,
    }

    #[async_trait]
    impl PriceProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Api
        }

        fn tickers(&self) -> Vec<ProviderTicker> {
            self.tickers.clone()
        }

        async fn start(&self, _shutdown: ShutdownSignal) -> ProviderResult<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            *self.counters.lock().unwrap().starts.entry(self.name.clone()).or_default() += 1;
            Ok(())
        }

        async fn stop(&self) {
            if self.running.swap(false, Ordering::SeqCst) {
                *self.counters.lock().unwrap().stops.entry(self.name.clone()).or_default() += 1;
            }
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn latest_prices(&self) -> HashMap<ProviderTicker, PriceResult> {
            HashMap::new()
        }

        fn metrics(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    struct FakeFactory {
        counters: SharedCounters,
        broken: HashSet<String>,
    }

    impl FakeFactory {
        fn new(broken: &[&str]) -> Self {
            Self {
                counters: Arc::new(StdMutex::new(Counters::default())),
                broken: broken.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn starts(&self, name: &str) -> usize {
            self.counters.lock().unwrap().starts.get(name).copied().unwrap_or(0)
        }

        fn stops(&self, name: &str) -> usize {
            self.counters.lock().unwrap().stops.get(name).copied().unwrap_or(0)
        }
    }

    impl ProviderFactory for FakeFactory {
        fn build(
            &self,
            config: &ProviderConfig,
            tickers: Vec<ProviderTicker>,
        ) -> Result<Arc<dyn PriceProvider>> {
            if self.broken.contains(&config.name) {
                anyhow::bail!("{}", ProviderError::Configuration("broken adapter".to_string()));
            }
            Ok(Arc::new(FakeProvider {
                name: config.name.clone(),
                tickers,
                running: AtomicBool::new(false),
                counters: self.counters.clone(),
            }))
        }
    }

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::Api,
            enabled: true,
            api: Some(ApiConfig::default()),
            websocket: None,
        }
    }

    fn map(markets: Vec<crate::marketmap::Market>) -> MarketMap {
        MarketMap::from_markets(markets).unwrap()
    }

    fn initial_map() -> MarketMap {
        map(vec![
            direct_market("BTC/USD", 1, &[("alpha", "BTC-USD"), ("beta", "BTCUSD")]),
            direct_market("ETH/USD", 1, &[("alpha", "ETH-USD")]),
        ])
    }

    fn orchestrator(factory: Arc<FakeFactory>, names: &[&str]) -> ProviderOrchestrator {
        ProviderOrchestrator::new(
            names.iter().map(|n| provider(n)).collect(),
            initial_map(),
            factory,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_assigns_tickers_per_provider() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta", "gamma"]);
        let (_root, signal) = shutdown::channel();

        orchestrator.start(&signal).await;
        orchestrator.start(&signal).await;

        assert_eq!(orchestrator.provider_state("alpha"), Some(ProviderState::Running));
        assert_eq!(orchestrator.provider_state("beta"), Some(ProviderState::Running));
        // Configured but unused by the map
        assert_eq!(orchestrator.provider_state("gamma"), Some(ProviderState::Stopped));
        assert_eq!(factory.starts("alpha"), 1);

        let alpha = orchestrator.provider_tickers("alpha").await.unwrap();
        assert_eq!(alpha.len(), 2);

        let live = orchestrator.get_price_providers();
        let mut names: Vec<&String> = live.keys().collect();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);

        orchestrator.stop().await;
        assert_eq!(orchestrator.provider_state("alpha"), Some(ProviderState::Stopped));
        assert!(orchestrator.get_price_providers().is_empty());
        assert_eq!(factory.stops("alpha"), 1);
        assert_eq!(factory.stops("beta"), 1);
    }

    #[tokio::test]
    async fn test_update_restarts_only_changed_providers() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta"]);
        let (_root, signal) = shutdown::channel();
        orchestrator.start(&signal).await;
        let alpha_before = orchestrator.get_price_providers()["alpha"].clone();

        // Only beta gains a ticker
        let updated = map(vec![
            direct_market("BTC/USD", 1, &[("alpha", "BTC-USD"), ("beta", "BTCUSD")]),
            direct_market("ETH/USD", 1, &[("alpha", "ETH-USD"), ("beta", "ETHUSD")]),
        ]);
        assert_ok!(orchestrator.update_market_map(updated).await);

        assert_eq!(factory.starts("alpha"), 1);
        assert_eq!(factory.stops("alpha"), 0);
        assert_eq!(factory.starts("beta"), 2);
        assert_eq!(factory.stops("beta"), 1);
        assert_eq!(orchestrator.provider_tickers("beta").await.unwrap().len(), 2);

        let alpha_after = orchestrator.get_price_providers()["alpha"].clone();
        assert!(Arc::ptr_eq(&alpha_before, &alpha_after));

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_provider_without_tickers_is_stopped() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta"]);
        let (_root, signal) = shutdown::channel();
        orchestrator.start(&signal).await;

        let updated = map(vec![direct_market("BTC/USD", 1, &[("alpha", "BTC-USD")])]);
        assert_ok!(orchestrator.update_market_map(updated).await);

        assert_eq!(orchestrator.provider_state("beta"), Some(ProviderState::Stopped));
        assert!(!orchestrator.get_price_providers().contains_key("beta"));
        assert_eq!(factory.stops("beta"), 1);
        // alpha lost ETH-USD, so it was restarted with the smaller set
        assert_eq!(factory.starts("alpha"), 2);
        assert_eq!(orchestrator.provider_tickers("alpha").await.unwrap().len(), 1);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_update_changes_nothing() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta"]);
        let (_root, signal) = shutdown::channel();
        orchestrator.start(&signal).await;

        let bad = map(vec![direct_market("BTC/USD", 1, &[("unknown", "BTC-USD")])]);
        let err = assert_err!(orchestrator.update_market_map(bad).await);
        assert_eq!(err, MarketMapError::UnknownProvider("unknown".to_string()));

        assert_eq!(orchestrator.market_map().len(), 2);
        assert_eq!(factory.starts("alpha"), 1);
        assert_eq!(factory.starts("beta"), 1);
        assert_eq!(orchestrator.get_price_providers().len(), 2);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_build_is_isolated() {
        let factory = Arc::new(FakeFactory::new(&["beta"]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta"]);
        let (_root, signal) = shutdown::channel();
        orchestrator.start(&signal).await;

        assert_eq!(orchestrator.provider_state("alpha"), Some(ProviderState::Running));
        assert_eq!(orchestrator.provider_state("beta"), Some(ProviderState::Stopped));
        assert_eq!(orchestrator.get_price_providers().len(), 1);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_update_before_start_only_swaps_map() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let orchestrator = orchestrator(factory.clone(), &["alpha", "beta"]);

        let updated = map(vec![direct_market("BTC/USD", 1, &[("beta", "BTCUSD")])]);
        assert_ok!(orchestrator.update_market_map(updated).await);
        assert_eq!(orchestrator.market_map().len(), 1);
        assert_eq!(factory.starts("beta"), 0);

        let (_root, signal) = shutdown::channel();
        orchestrator.start(&signal).await;
        assert_eq!(orchestrator.provider_state("alpha"), Some(ProviderState::Stopped));
        assert_eq!(factory.starts("beta"), 1);
        orchestrator.stop().await;
    }

    #[test]
    fn test_unknown_provider_rejected_at_construction() {
        let factory = Arc::new(FakeFactory::new(&[]));
        let result = ProviderOrchestrator::new(vec![provider("alpha")], initial_map(), factory);
        assert!(result.is_err());
    }
}
