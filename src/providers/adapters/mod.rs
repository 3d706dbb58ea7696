//! Exchange adapters (Coinbase spot REST, Binance ticker stream)
//!
//! Adapters only translate: tickers to requests/subscriptions, payloads to
//! price results. Transport, retries and caching belong to the runners.

mod binance;
mod coinbase;

pub use binance::{BinanceWsHandler, BINANCE_WS_NAME, BINANCE_WS_URL};
pub use coinbase::{CoinbaseApiHandler, COINBASE_API_NAME, COINBASE_API_URL};
