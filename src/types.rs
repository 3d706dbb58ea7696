//! Core types used throughout the oracle side-car
//!
//! Defines currency pairs, provider-specific tickers, and the per-ticker
//! results every provider response is made of.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Canonical `BASE/QUOTE` identity of a market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// The same pair seen from the other side (`QUOTE/BASE`).
    pub fn inverted(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| format!("currency pair {:?} must be formatted as BASE/QUOTE", s))?;
        let (base, quote) = (base.trim(), quote.trim());
        if base.is_empty() || quote.is_empty() {
            return Err(format!("currency pair {:?} has an empty side", s));
        }
        if quote.contains('/') {
            return Err(format!("currency pair {:?} has more than one separator", s));
        }
        Ok(Self::new(base, quote))
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

/// A pair as a single provider names it (e.g. `BTC-USD`, `btcusdt`), plus
/// optional adapter metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderTicker {
    pub off_chain_ticker: String,
    #[serde(default)]
    pub metadata_json: String,
}

impl ProviderTicker {
    pub fn new(off_chain_ticker: impl Into<String>) -> Self {
        Self {
            off_chain_ticker: off_chain_ticker.into(),
            metadata_json: String::new(),
        }
    }

    pub fn with_metadata(
        off_chain_ticker: impl Into<String>,
        metadata_json: impl Into<String>,
    ) -> Self {
        Self {
            off_chain_ticker: off_chain_ticker.into(),
            metadata_json: metadata_json.into(),
        }
    }
}

impl fmt::Display for ProviderTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.off_chain_ticker)
    }
}

/// A successfully parsed quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceResult {
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PriceResult {
    pub fn new(value: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Why a ticker could not be resolved in a given response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unknown,
    NoResponse,
    ApiGeneral,
    RateLimit,
    Timeout,
    InvalidResponse,
    ParseError,
    WebSocketGeneral,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::NoResponse => "no_response",
            ErrorKind::ApiGeneral => "api_general",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::WebSocketGeneral => "websocket_general",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedResult {
    pub kind: ErrorKind,
    pub cause: String,
}

impl UnresolvedResult {
    pub fn new(kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for UnresolvedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.cause)
    }
}

/// Outcome of one request or message for a batch of tickers.
///
/// A ticker lives in at most one of the two maps. Runners call
/// [`PriceResponse::complete`] with the requested batch so that every
/// requested ticker ends up in exactly one of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceResponse {
    pub resolved: HashMap<ProviderTicker, PriceResult>,
    pub unresolved: HashMap<ProviderTicker, UnresolvedResult>,
}

impl PriceResponse {
    pub fn new(
        resolved: HashMap<ProviderTicker, PriceResult>,
        unresolved: HashMap<ProviderTicker, UnresolvedResult>,
    ) -> Self {
        let mut response = Self {
            resolved,
            unresolved,
        };
        let resolved = &response.resolved;
        response.unresolved.retain(|ticker, _| !resolved.contains_key(ticker));
        response
    }

    /// Marks every ticker in `tickers` unresolved with the same cause.
    pub fn all_unresolved(
        tickers: &[ProviderTicker],
        kind: ErrorKind,
        cause: impl Into<String>,
    ) -> Self {
        let cause = cause.into();
        let unresolved = tickers
            .iter()
            .map(|t| (t.clone(), UnresolvedResult::new(kind, cause.clone())))
            .collect();
        Self {
            resolved: HashMap::new(),
            unresolved,
        }
    }

    pub fn insert_resolved(&mut self, ticker: ProviderTicker, result: PriceResult) {
        self.unresolved.remove(&ticker);
        self.resolved.insert(ticker, result);
    }

    pub fn insert_unresolved(&mut self, ticker: ProviderTicker, result: UnresolvedResult) {
        if !self.resolved.contains_key(&ticker) {
            self.unresolved.insert(ticker, result);
        }
    }

    /// Fills in a `NoResponse` entry for every requested ticker the adapter
    /// left out.
    pub fn complete(mut self, requested: &[ProviderTicker]) -> Self {
        for ticker in requested {
            if !self.resolved.contains_key(ticker) && !self.unresolved.contains_key(ticker) {
                self.unresolved.insert(
                    ticker.clone(),
                    UnresolvedResult::new(
                        ErrorKind::NoResponse,
                        "ticker missing from provider response",
                    ),
                );
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.unresolved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resolved.len() + self.unresolved.len()
    }
}
