//! Market map - which pairs the oracle tracks and how each one is priced
//!
//! A [`MarketMap`] is immutable once built. Updates replace the whole map
//! and are validated before anything downstream sees them.
//!
//! # Pricing model
//! - Every [`Market`] lists the providers that quote its pair directly
//!   ([`ProviderTickerConfig`]) and, optionally, explicit
//!   [`ConversionPath`]s.
//! - A market without explicit paths is priced from one direct path per
//!   provider config, in configuration order.
//! - A path hop with provider [`INDEX_PROVIDER`] reads the previously
//!   published aggregate for that hop's pair.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::types::{CurrencyPair, ProviderTicker};

/// Reserved provider name for hops priced from the last published snapshot.
pub const INDEX_PROVIDER: &str = "index";

/// Largest scale a `rust_decimal::Decimal` can carry.
pub const MAX_DECIMALS: u32 = 28;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketMapError {
    #[error("duplicate ticker definition: {0}")]
    DuplicateTicker(CurrencyPair),

    #[error("invalid ticker {pair}: {reason}")]
    InvalidTicker { pair: CurrencyPair, reason: String },

    #[error("ticker {0} has a conversion path with no operations")]
    EmptyPath(CurrencyPair),

    #[error("ticker {pair} has a malformed conversion path: {reason}")]
    BrokenPath { pair: CurrencyPair, reason: String },

    #[error("ticker {ticker} references unknown market {referenced}")]
    UnknownMarket {
        ticker: CurrencyPair,
        referenced: CurrencyPair,
    },

    #[error("market {pair} has no provider config for {provider}")]
    MissingProviderConfig { pair: CurrencyPair, provider: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("ticker {pair} needs {required} providers but only {available} can price it")]
    QuorumUnreachable {
        pair: CurrencyPair,
        required: usize,
        available: usize,
    },

    #[error("failed to parse market map: {0}")]
    Parse(String),
}

/// Canonical market identity plus output precision and quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub currency_pair: CurrencyPair,
    /// Fixed-point scale of the published price.
    pub decimals: u32,
    /// Minimum number of provider candidates needed to publish a price.
    pub min_provider_count: usize,
    /// Disabled markets are never published but can still feed conversions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// How one provider names a market's pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTickerConfig {
    pub name: String,
    pub off_chain_ticker: String,
    #[serde(default)]
    pub metadata_json: String,
}

impl ProviderTickerConfig {
    pub fn provider_ticker(&self) -> ProviderTicker {
        ProviderTicker::with_metadata(self.off_chain_ticker.clone(), self.metadata_json.clone())
    }
}

/// One hop of a conversion path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub currency_pair: CurrencyPair,
    pub provider: String,
    #[serde(default)]
    pub invert: bool,
}

impl Operation {
    pub fn new(currency_pair: CurrencyPair, provider: impl Into<String>, invert: bool) -> Self {
        Self {
            currency_pair,
            provider: provider.into(),
            invert,
        }
    }

    pub fn is_index(&self) -> bool {
        self.provider == INDEX_PROVIDER
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionPath {
    pub operations: Vec<Operation>,
}

impl ConversionPath {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn direct(pair: CurrencyPair, provider: impl Into<String>) -> Self {
        Self::new(vec![Operation::new(pair, provider, false)])
    }

    /// The provider a surviving path's price is attributed to: the first
    /// hop that is not an index hop.
    pub fn provider(&self) -> Option<&str> {
        self.operations
            .iter()
            .find(|op| !op.is_index())
            .map(|op| op.provider.as_str())
    }

    /// Checks that the hops chain from `ticker.base` to `ticker.quote`.
    fn check_chain(&self, ticker: &CurrencyPair) -> Result<(), String> {
        let mut current = ticker.base.as_str();
        for (i, op) in self.operations.iter().enumerate() {
            let (from, to) = if op.invert {
                (op.currency_pair.quote.as_str(), op.currency_pair.base.as_str())
            } else {
                (op.currency_pair.base.as_str(), op.currency_pair.quote.as_str())
            };
            if from != current {
                return Err(format!(
                    "hop {} ({}, invert={}) starts at {} but the path is at {}",
                    i, op.currency_pair, op.invert, from, current
                ));
            }
            current = to;
        }
        if current != ticker.quote {
            return Err(format!("path ends at {} instead of {}", current, ticker.quote));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: Ticker,
    #[serde(default)]
    pub provider_configs: Vec<ProviderTickerConfig>,
    /// Alternative routes to a price. Several may share a provider (say a
    /// direct quote and a stable-coin bridge); each tick the first one in
    /// this order that resolves is that provider's candidate. Identical
    /// paths are rejected.
    #[serde(default)]
    pub paths: Vec<ConversionPath>,
}

impl Market {
    pub fn pair(&self) -> &CurrencyPair {
        &self.ticker.currency_pair
    }

    /// Explicit paths, or one direct path per provider config.
    pub fn effective_paths(&self) -> Vec<ConversionPath> {
        if !self.paths.is_empty() {
            return self.paths.clone();
        }
        self.provider_configs
            .iter()
            .map(|cfg| ConversionPath::direct(self.pair().clone(), cfg.name.clone()))
            .collect()
    }

    pub fn provider_config(&self, provider: &str) -> Option<&ProviderTickerConfig> {
        self.provider_configs.iter().find(|cfg| cfg.name == provider)
    }
}

#[derive(Debug, Deserialize)]
struct MarketMapFile {
    markets: Vec<Market>,
}

/// Validated, immutable mapping of tickers to their markets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarketMap {
    markets: BTreeMap<CurrencyPair, Market>,
}

impl MarketMap {
    /// Builds and validates a map. Fails on duplicate tickers and on any
    /// malformed ticker or path.
    pub fn from_markets(markets: Vec<Market>) -> Result<Self, MarketMapError> {
        let mut map = BTreeMap::new();
        for market in markets {
            let pair = market.pair().clone();
            if map.insert(pair.clone(), market).is_some() {
                return Err(MarketMapError::DuplicateTicker(pair));
            }
        }
        let map = Self { markets: map };
        map.validate()?;
        Ok(map)
    }

    pub fn from_json(raw: &str) -> Result<Self, MarketMapError> {
        let file: MarketMapFile =
            serde_json::from_str(raw).map_err(|e| MarketMapError::Parse(e.to_string()))?;
        Self::from_markets(file.markets)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MarketMapError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MarketMapError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn get(&self, pair: &CurrencyPair) -> Option<&Market> {
        self.markets.get(pair)
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn enabled_markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values().filter(|m| m.ticker.enabled)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// The provider ticker a hop reads, if the hop's market has a config
    /// for that provider.
    pub fn provider_ticker(&self, pair: &CurrencyPair, provider: &str) -> Option<ProviderTicker> {
        self.markets
            .get(pair)
            .and_then(|m| m.provider_config(provider))
            .map(ProviderTickerConfig::provider_ticker)
    }

    /// Every provider name referenced by the map, index hops excluded.
    pub fn provider_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for market in self.markets.values() {
            names.extend(market.provider_configs.iter().map(|c| c.name.clone()));
            for path in &market.paths {
                names.extend(
                    path.operations
                        .iter()
                        .filter(|op| !op.is_index())
                        .map(|op| op.provider.clone()),
                );
            }
        }
        names
    }

    /// The tickers `provider` must fetch: everything an enabled market's
    /// paths read from it, including conversion-only markets.
    pub fn provider_tickers(&self, provider: &str) -> BTreeSet<ProviderTicker> {
        let mut tickers = BTreeSet::new();
        for market in self.enabled_markets() {
            for path in market.effective_paths() {
                for op in path.operations.iter().filter(|op| op.provider == provider) {
                    if let Some(ticker) = self.provider_ticker(&op.currency_pair, provider) {
                        tickers.insert(ticker);
                    }
                }
            }
        }
        tickers
    }

    /// Rejects references to providers outside `known`.
    pub fn validate_providers(&self, known: &HashSet<String>) -> Result<(), MarketMapError> {
        for name in self.provider_names() {
            if !known.contains(&name) {
                return Err(MarketMapError::UnknownProvider(name));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), MarketMapError> {
        for market in self.markets.values() {
            self.validate_market(market)?;
        }
        Ok(())
    }

    fn validate_market(&self, market: &Market) -> Result<(), MarketMapError> {
        let ticker = &market.ticker;
        let pair = &ticker.currency_pair;
        let invalid = |reason: &str| MarketMapError::InvalidTicker {
            pair: pair.clone(),
            reason: reason.to_string(),
        };

        if pair.base == pair.quote {
            return Err(invalid("base and quote are the same asset"));
        }
        if ticker.decimals > MAX_DECIMALS {
            return Err(invalid(&format!("decimals must be at most {}", MAX_DECIMALS)));
        }
        if ticker.min_provider_count == 0 {
            return Err(invalid("min_provider_count must be at least 1"));
        }

        let mut seen = HashSet::new();
        for cfg in &market.provider_configs {
            if cfg.name.is_empty() || cfg.name == INDEX_PROVIDER {
                return Err(invalid(&format!("invalid provider name {:?}", cfg.name)));
            }
            if cfg.off_chain_ticker.is_empty() {
                return Err(invalid(&format!(
                    "provider {} has an empty off-chain ticker",
                    cfg.name
                )));
            }
            if !seen.insert(cfg.name.as_str()) {
                return Err(invalid(&format!("provider {} is configured twice", cfg.name)));
            }
        }

        let paths = market.effective_paths();
        let mut providers = HashSet::new();
        for (i, path) in paths.iter().enumerate() {
            if path.operations.is_empty() {
                return Err(MarketMapError::EmptyPath(pair.clone()));
            }
            if paths[..i].contains(path) {
                return Err(MarketMapError::BrokenPath {
                    pair: pair.clone(),
                    reason: "path is listed twice".to_string(),
                });
            }
            path.check_chain(pair).map_err(|reason| MarketMapError::BrokenPath {
                pair: pair.clone(),
                reason,
            })?;
            let provider = path.provider().ok_or_else(|| MarketMapError::BrokenPath {
                pair: pair.clone(),
                reason: "path only has index hops".to_string(),
            })?;
            providers.insert(provider);

            for op in &path.operations {
                if op.is_index() {
                    if op.currency_pair == *pair {
                        return Err(MarketMapError::BrokenPath {
                            pair: pair.clone(),
                            reason: "index hop cannot reference the ticker itself".to_string(),
                        });
                    }
                    if !self.markets.contains_key(&op.currency_pair) {
                        return Err(MarketMapError::UnknownMarket {
                            ticker: pair.clone(),
                            referenced: op.currency_pair.clone(),
                        });
                    }
                    continue;
                }
                let hop_market =
                    self.markets
                        .get(&op.currency_pair)
                        .ok_or_else(|| MarketMapError::UnknownMarket {
                            ticker: pair.clone(),
                            referenced: op.currency_pair.clone(),
                        })?;
                if hop_market.provider_config(&op.provider).is_none() {
                    return Err(MarketMapError::MissingProviderConfig {
                        pair: op.currency_pair.clone(),
                        provider: op.provider.clone(),
                    });
                }
            }
        }

        if ticker.enabled && providers.len() < ticker.min_provider_count {
            return Err(MarketMapError::QuorumUnreachable {
                pair: pair.clone(),
                required: ticker.min_provider_count,
                available: providers.len(),
            });
        }
        Ok(())
    }
}
