//! Coinbase spot price REST adapter
//!
//! `GET {base}/v2/prices/{BASE-QUOTE}/spot` returns
//! `{"data":{"amount":"64000.12","base":"BTC","currency":"USD"}}`.
//! The endpoint prices a single pair per request.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::providers::api::{ApiDataHandler, RawResponse};
use crate::providers::{ProviderError, ProviderResult};
use crate::types::{ErrorKind, PriceResponse, PriceResult, ProviderTicker, UnresolvedResult};

pub const COINBASE_API_NAME: &str = "coinbase_api";
pub const COINBASE_API_URL: &str = "https://api.coinbase.com";

#[derive(Debug, Deserialize)]
struct SpotResponse {
    data: SpotData,
}

#[derive(Debug, Deserialize)]
struct SpotData {
    amount: String,
}

#[derive(Debug, Clone)]
pub struct CoinbaseApiHandler {
    base_url: String,
}

impl CoinbaseApiHandler {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(COINBASE_API_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

impl ApiDataHandler for CoinbaseApiHandler {
    fn create_url(&self, tickers: &[ProviderTicker]) -> ProviderResult<String> {
        match tickers {
            [ticker] => Ok(format!("{}/v2/prices/{}/spot", self.base_url, ticker.off_chain_ticker)),
            _ => Err(ProviderError::Configuration(format!(
                "coinbase prices one ticker per request, got {}",
                tickers.len()
            ))),
        }
    }

    fn parse_response(&self, tickers: &[ProviderTicker], response: &RawResponse) -> PriceResponse {
        let Some(ticker) = tickers.first() else {
            return PriceResponse::default();
        };

        let parsed = serde_json::from_str::<SpotResponse>(&response.body)
            .map_err(|e| UnresolvedResult::new(ErrorKind::InvalidResponse, e.to_string()))
            .and_then(|spot| {
                Decimal::from_str(&spot.data.amount)
                    .map_err(|e| UnresolvedResult::new(ErrorKind::ParseError, e.to_string()))
            });

        let mut out = PriceResponse::default();
        match parsed {
            Ok(value) => out.insert_resolved(ticker.clone(), PriceResult::new(value, Utc::now())),
            Err(unresolved) => out.insert_unresolved(ticker.clone(), unresolved),
        }
        out
    }

    fn max_batch_size(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_create_url() {
        let handler = CoinbaseApiHandler::new(None);
        let url = assert_ok!(handler.create_url(&[ProviderTicker::new("BTC-USD")]));
        assert_eq!(url, "https://api.coinbase.com/v2/prices/BTC-USD/spot");

        let custom = CoinbaseApiHandler::new(Some("http://localhost:8080/"));
        let url = assert_ok!(custom.create_url(&[ProviderTicker::new("ETH-USD")]));
        assert_eq!(url, "http://localhost:8080/v2/prices/ETH-USD/spot");

        assert_err!(handler.create_url(&[ProviderTicker::new("A"), ProviderTicker::new("B")]));
    }

    #[test]
    fn test_parse_spot_price() {
        let handler = CoinbaseApiHandler::new(None);
        let btc = ProviderTicker::new("BTC-USD");
        let body = r#"{"data":{"amount":"64000.12","base":"BTC","currency":"USD"}}"#;

        let response = handler.parse_response(&[btc.clone()], &RawResponse::ok(body));
        assert_eq!(response.resolved[&btc].value, dec!(64000.12));
    }

    #[test]
    fn test_parse_failures_are_per_ticker() {
        let handler = CoinbaseApiHandler::new(None);
        let btc = ProviderTicker::new("BTC-USD");

        let response = handler.parse_response(&[btc.clone()], &RawResponse::ok("<html>"));
        assert_eq!(response.unresolved[&btc].kind, ErrorKind::InvalidResponse);

        let body = r#"{"data":{"amount":"not-a-number"}}"#;
        let response = handler.parse_response(&[btc.clone()], &RawResponse::ok(body));
        assert_eq!(response.unresolved[&btc].kind, ErrorKind::ParseError);
    }
}
