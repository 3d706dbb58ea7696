//! Price Aggregator - Reduces per-provider quotes to one price per ticker
//!
//! Each tick, for every enabled market:
//! 1. evaluate its conversion paths against the providers' latest prices,
//!    dropping any path with a missing or stale hop
//! 2. keep one candidate per provider (first surviving path wins)
//! 3. skip the market if fewer than `min_provider_count` candidates remain
//! 4. publish the median, rounded to the ticker's decimals
//!
//! The finished snapshot replaces the previous one in a single swap.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::marketmap::{ConversionPath, Market, MarketMap, Operation};
use crate::types::{CurrencyPair, PriceResult, ProviderTicker};

/// Latest observations per provider, as read from the live runners.
pub type ProviderPrices = HashMap<String, HashMap<ProviderTicker, PriceResult>>;

/// Published price for one ticker
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPrice {
    pub price: Decimal,
    /// Tick at which the price was computed
    pub timestamp: DateTime<Utc>,
    /// Candidates the median was taken over
    pub provider_count: usize,
}

/// Immutable result of one aggregation tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSnapshot {
    /// `None` until the first tick has been published
    pub timestamp: Option<DateTime<Utc>>,
    pub prices: HashMap<CurrencyPair, AggregatedPrice>,
}

impl PriceSnapshot {
    pub fn get(&self, pair: &CurrencyPair) -> Option<&AggregatedPrice> {
        self.prices.get(pair)
    }

    pub fn price(&self, pair: &CurrencyPair) -> Option<Decimal> {
        self.prices.get(pair).map(|p| p.price)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Why a conversion path produced no candidate this tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("no price for {pair} from {provider}")]
    MissingPrice { pair: CurrencyPair, provider: String },

    #[error("price for {pair} from {provider} is {age_ms}ms old")]
    StalePrice {
        pair: CurrencyPair,
        provider: String,
        age_ms: u128,
    },

    #[error("inverted hop {0} has a zero price")]
    DivisionByZero(CurrencyPair),

    #[error("path overflowed at hop {0}")]
    Overflow(CurrencyPair),
}

pub struct PriceAggregator {
    max_price_age: Duration,
    snapshot: RwLock<Arc<PriceSnapshot>>,
}

impl PriceAggregator {
    pub fn new(max_price_age: Duration) -> Self {
        Self {
            max_price_age,
            snapshot: RwLock::new(Arc::new(PriceSnapshot::default())),
        }
    }

    /// Latest published snapshot. Never blocks on an in-progress tick.
    pub fn snapshot(&self) -> Arc<PriceSnapshot> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Computes and publishes a new snapshot.
    pub fn aggregate(
        &self,
        map: &MarketMap,
        prices: &ProviderPrices,
        now: DateTime<Utc>,
    ) -> Arc<PriceSnapshot> {
        let snapshot = self.compute(map, prices, now);
        self.publish(snapshot)
    }

    pub fn publish(&self, snapshot: PriceSnapshot) -> Arc<PriceSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut current = match self.snapshot.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = snapshot.clone();
        snapshot
    }

    /// Builds the next snapshot off to the side. Index hops read the
    /// currently published one.
    pub fn compute(
        &self,
        map: &MarketMap,
        prices: &ProviderPrices,
        now: DateTime<Utc>,
    ) -> PriceSnapshot {
        let previous = self.snapshot();
        let mut next = PriceSnapshot {
            timestamp: Some(now),
            prices: HashMap::new(),
        };

        for market in map.enabled_markets() {
            if let Some(price) = self.aggregate_market(market, map, prices, &previous, now) {
                next.prices.insert(market.pair().clone(), price);
            }
        }
        next
    }

    fn aggregate_market(
        &self,
        market: &Market,
        map: &MarketMap,
        prices: &ProviderPrices,
        previous: &PriceSnapshot,
        now: DateTime<Utc>,
    ) -> Option<AggregatedPrice> {
        let pair = market.pair();
        let mut providers = HashSet::new();
        let mut candidates = Vec::new();

        for path in market.effective_paths() {
            let Some(provider) = path.provider() else {
                continue;
            };
            if providers.contains(provider) {
                continue;
            }
            match self.evaluate_path(&path, map, prices, previous, now) {
                Ok(value) => {
                    providers.insert(provider.to_string());
                    candidates.push(value);
                }
                Err(e) => debug!(ticker = %pair, provider = %provider, reason = %e, "Path dropped"),
            }
        }

        if candidates.len() < market.ticker.min_provider_count {
            debug!(
                ticker = %pair,
                candidates = candidates.len(),
                required = market.ticker.min_provider_count,
                "Quorum not met"
            );
            return None;
        }

        let provider_count = candidates.len();
        let median = median(candidates)?;
        Some(AggregatedPrice {
            price: median.round_dp(market.ticker.decimals),
            timestamp: now,
            provider_count,
        })
    }

    /// Multiplies the hop prices along `path`, dividing for inverted hops.
    pub fn evaluate_path(
        &self,
        path: &ConversionPath,
        map: &MarketMap,
        prices: &ProviderPrices,
        previous: &PriceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Decimal, PathError> {
        let mut value = Decimal::ONE;
        for op in &path.operations {
            let hop = self.hop_price(op, map, prices, previous, now)?;
            value = if op.invert {
                if hop.is_zero() {
                    return Err(PathError::DivisionByZero(op.currency_pair.clone()));
                }
                value.checked_div(hop)
            } else {
                value.checked_mul(hop)
            }
            .ok_or_else(|| PathError::Overflow(op.currency_pair.clone()))?;
        }
        Ok(value)
    }

    fn hop_price(
        &self,
        op: &Operation,
        map: &MarketMap,
        prices: &ProviderPrices,
        previous: &PriceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Decimal, PathError> {
        let missing = || PathError::MissingPrice {
            pair: op.currency_pair.clone(),
            provider: op.provider.clone(),
        };

        let (value, timestamp) = if op.is_index() {
            let price = previous.get(&op.currency_pair).ok_or_else(missing)?;
            (price.price, price.timestamp)
        } else {
            let ticker = map
                .provider_ticker(&op.currency_pair, &op.provider)
                .ok_or_else(missing)?;
            let result = prices
                .get(&op.provider)
                .and_then(|quotes| quotes.get(&ticker))
                .ok_or_else(missing)?;
            (result.value, result.timestamp)
        };

        // A timestamp ahead of `now` counts as fresh
        if let Ok(age) = (now - timestamp).to_std() {
            if age > self.max_price_age {
                return Err(PathError::StalePrice {
                    pair: op.currency_pair.clone(),
                    provider: op.provider.clone(),
                    age_ms: age.as_millis(),
                });
            }
        }
        Ok(value)
    }
}

/// Standard median: middle value, or the mean of the two middle values.
pub fn median(mut values: Vec<Decimal>) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        values[mid - 1]
            .checked_add(values[mid])
            .and_then(|sum| sum.checked_div(Decimal::TWO))
    }
}
