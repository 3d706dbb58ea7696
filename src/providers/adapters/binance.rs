//! Binance 24h ticker stream adapter
//!
//! Subscribes with `{"method":"SUBSCRIBE","params":["btcusdt@ticker"],"id":n}`
//! and reads `24hrTicker` events, either raw or wrapped in the combined
//! stream envelope `{"stream":...,"data":{...}}`.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use crate::providers::websocket::WebSocketDataHandler;
use crate::providers::{ProviderError, ProviderResult};
use crate::types::{PriceResponse, PriceResult, ProviderTicker};

pub const BINANCE_WS_NAME: &str = "binance_ws";
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    method: &'a str,
    params: Vec<String>,
    id: u64,
}

/// Per-connection state: the next request id and the symbols subscribed so far.
#[derive(Debug, Default)]
pub struct BinanceWsHandler {
    next_id: u64,
    symbols: HashMap<String, ProviderTicker>,
}

impl BinanceWsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_name(ticker: &ProviderTicker) -> String {
        format!("{}@ticker", ticker.off_chain_ticker.to_lowercase())
    }

    fn parse_ticker(&self, data: &Value) -> ProviderResult<PriceResponse> {
        let symbol = data["s"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("ticker event without symbol".to_string()))?;
        let Some(ticker) = self.symbols.get(&symbol.to_uppercase()) else {
            // Not ours; can happen right after a resubscribe
            return Ok(PriceResponse::default());
        };

        let price = data["c"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse(format!("{} event without last price", symbol)))?;
        let value = Decimal::from_str(price)
            .map_err(|e| ProviderError::Parse(format!("{} price {:?}: {}", symbol, price, e)))?;
        let timestamp = data["E"]
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let mut response = PriceResponse::default();
        response.insert_resolved(ticker.clone(), PriceResult::new(value, timestamp));
        Ok(response)
    }
}

impl WebSocketDataHandler for BinanceWsHandler {
    fn handle_message(&mut self, message: &str) -> ProviderResult<(PriceResponse, Vec<String>)> {
        let value: Value =
            serde_json::from_str(message).map_err(|e| ProviderError::Parse(e.to_string()))?;

        // Subscription errors: {"error":{"code":2,"msg":"..."},"id":1} or {"code":..,"msg":..}
        if let Some(error) = value.get("error").or_else(|| value.get("code").map(|_| &value)) {
            let msg = error["msg"].as_str().unwrap_or("unknown error");
            return Err(ProviderError::Subscription(format!(
                "code {}: {}",
                error["code"], msg
            )));
        }

        // Subscription ack: {"result":null,"id":1}
        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok((PriceResponse::default(), Vec::new()));
        }

        let data = value.get("data").unwrap_or(&value);
        match data["e"].as_str() {
            Some("24hrTicker") => Ok((self.parse_ticker(data)?, Vec::new())),
            Some(other) => Err(ProviderError::Parse(format!("unexpected event type {}", other))),
            None => Err(ProviderError::Parse("message without event type".to_string())),
        }
    }

    fn create_messages(&mut self, tickers: &[ProviderTicker]) -> ProviderResult<Vec<String>> {
        if tickers.is_empty() {
            return Ok(Vec::new());
        }
        for ticker in tickers {
            self.symbols
                .insert(ticker.off_chain_ticker.to_uppercase(), ticker.clone());
        }

        self.next_id += 1;
        let request = SubscribeRequest {
            method: "SUBSCRIBE",
            params: tickers.iter().map(Self::stream_name).collect(),
            id: self.next_id,
        };
        let message =
            serde_json::to_string(&request).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(vec![message])
    }

    fn heartbeat_messages(&self) -> Vec<String> {
        // Binance pings us; tungstenite answers
        Vec::new()
    }

    fn copy(&self) -> Box<dyn WebSocketDataHandler> {
        Box::new(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn subscribed(symbols: &[&str]) -> BinanceWsHandler {
        let mut handler = BinanceWsHandler::new();
        let tickers: Vec<ProviderTicker> =
            symbols.iter().map(|s| ProviderTicker::new(*s)).collect();
        handler.create_messages(&tickers).unwrap();
        handler
    }

    #[test]
    fn test_subscribe_ids_increase_and_reset_on_copy() {
        let mut handler = BinanceWsHandler::new();
        let first = handler.create_messages(&[ProviderTicker::new("BTCUSDT")]).unwrap();
        let second = handler.create_messages(&[ProviderTicker::new("ETHUSDT")]).unwrap();

        assert_eq!(
            first[0],
            r#"{"method":"SUBSCRIBE","params":["btcusdt@ticker"],"id":1}"#
        );
        assert!(second[0].contains(r#""id":2"#));

        let mut fresh = handler.copy();
        let again = fresh.create_messages(&[ProviderTicker::new("BTCUSDT")]).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_ticker_event() {
        let mut handler = subscribed(&["BTCUSDT"]);
        let raw = r#"{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"64000.50"}"#;

        let (response, replies) = assert_ok!(handler.handle_message(raw));
        assert!(replies.is_empty());
        let price = &response.resolved[&ProviderTicker::new("BTCUSDT")];
        assert_eq!(price.value, dec!(64000.50));
        assert_eq!(price.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_combined_stream_envelope() {
        let mut handler = subscribed(&["ETHUSDT"]);
        let raw = r#"{"stream":"ethusdt@ticker",
            "data":{"e":"24hrTicker","E":1,"s":"ETHUSDT","c":"2000"}}"#;

        let (response, _) = assert_ok!(handler.handle_message(raw));
        assert_eq!(response.resolved[&ProviderTicker::new("ETHUSDT")].value, dec!(2000));
    }

    #[test]
    fn test_ack_and_unknown_symbol_are_empty() {
        let mut handler = subscribed(&["BTCUSDT"]);

        let (ack, _) = assert_ok!(handler.handle_message(r#"{"result":null,"id":1}"#));
        assert!(ack.is_empty());

        let other = r#"{"e":"24hrTicker","E":1,"s":"SOLUSDT","c":"150"}"#;
        let (response, _) = assert_ok!(handler.handle_message(other));
        assert!(response.is_empty());
    }

    #[test]
    fn test_errors() {
        let mut handler = subscribed(&["BTCUSDT"]);

        assert!(matches!(
            handler.handle_message(r#"{"error":{"code":2,"msg":"Invalid request"},"id":1}"#),
            Err(ProviderError::Subscription(_))
        ));
        assert!(matches!(
            handler.handle_message(r#"{"code":1,"msg":"bad"}"#),
            Err(ProviderError::Subscription(_))
        ));
        assert_err!(handler.handle_message("not json"));
        assert_err!(handler.handle_message(r#"{"e":"24hrTicker","s":"BTCUSDT","c":"abc"}"#));
        assert_err!(handler.handle_message(r#"{"e":"trade","s":"BTCUSDT"}"#));
    }
}
