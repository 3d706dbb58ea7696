//! Per-provider price cache

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{PriceResponse, PriceResult, ProviderTicker, UnresolvedResult};

#[derive(Debug, Default)]
struct CacheInner {
    prices: HashMap<ProviderTicker, PriceResult>,
    errors: HashMap<ProviderTicker, UnresolvedResult>,
}

/// Latest observation per ticker, written only by the owning runner.
///
/// An observation older than the cached one for the same ticker is
/// ignored; unresolved results never evict a cached price.
#[derive(Debug, Default)]
pub struct PriceCache {
    inner: RwLock<CacheInner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUpdate {
    pub updated: usize,
    pub out_of_order: usize,
    pub unresolved: usize,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, response: PriceResponse) -> CacheUpdate {
        let mut update = CacheUpdate::default();
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (ticker, result) in response.resolved {
            let newer = inner
                .prices
                .get(&ticker)
                .map_or(true, |existing| result.timestamp >= existing.timestamp);
            if newer {
                inner.errors.remove(&ticker);
                inner.prices.insert(ticker, result);
                update.updated += 1;
            } else {
                update.out_of_order += 1;
            }
        }

        for (ticker, result) in response.unresolved {
            inner.errors.insert(ticker, result);
            update.unresolved += 1;
        }
        update
    }

    pub fn prices(&self) -> HashMap<ProviderTicker, PriceResult> {
        match self.inner.read() {
            Ok(guard) => guard.prices.clone(),
            Err(poisoned) => poisoned.into_inner().prices.clone(),
        }
    }

    pub fn last_error(&self, ticker: &ProviderTicker) -> Option<UnresolvedResult> {
        self.inner.read().ok()?.errors.get(ticker).cloned()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.prices.clear();
            inner.errors.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn resolved(ticker: &ProviderTicker, result: PriceResult) -> PriceResponse {
        let mut response = PriceResponse::default();
        response.insert_resolved(ticker.clone(), result);
        response
    }

    #[test]
    fn test_newer_observation_overwrites() {
        let cache = PriceCache::new();
        let btc = ProviderTicker::new("BTC-USD");
        let now = Utc::now();

        cache.apply(resolved(&btc, PriceResult::new(dec!(64000), now - Duration::seconds(5))));
        let update = cache.apply(resolved(&btc, PriceResult::new(dec!(64100), now)));
        assert_eq!(update.updated, 1);
        assert_eq!(cache.prices()[&btc].value, dec!(64100));
    }

    #[test]
    fn test_older_observation_never_rolls_back() {
        let cache = PriceCache::new();
        let btc = ProviderTicker::new("BTC-USD");
        let now = Utc::now();

        cache.apply(resolved(&btc, PriceResult::new(dec!(64100), now)));
        let older = PriceResult::new(dec!(63000), now - Duration::seconds(1));
        let update = cache.apply(resolved(&btc, older));
        assert_eq!(update.out_of_order, 1);
        assert_eq!(cache.prices()[&btc].value, dec!(64100));
    }

    #[test]
    fn test_unresolved_keeps_last_price() {
        let cache = PriceCache::new();
        let btc = ProviderTicker::new("BTC-USD");

        cache.apply(resolved(&btc, PriceResult::new(dec!(64000), Utc::now())));
        cache.apply(PriceResponse::all_unresolved(&[btc.clone()], ErrorKind::Timeout, "slow"));

        assert_eq!(cache.prices()[&btc].value, dec!(64000));
        assert_eq!(cache.last_error(&btc).map(|e| e.kind), Some(ErrorKind::Timeout));

        cache.clear();
        assert!(cache.prices().is_empty());
        assert!(cache.last_error(&btc).is_none());
    }
}
