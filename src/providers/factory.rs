//! Provider factory
//!
//! Turns a provider config plus a ticker set into a ready-to-start runner.
//! The orchestrator goes through this trait, so tests can hand it fakes.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use super::adapters::{BinanceWsHandler, CoinbaseApiHandler, BINANCE_WS_NAME, COINBASE_API_NAME};
use super::api::{ApiQueryHandler, HttpRequestHandler};
use super::websocket::{TungsteniteConnector, WebSocketQueryHandler};
use super::{PriceProvider, Provider};
use crate::config::{ProviderConfig, ProviderKind};
use crate::types::ProviderTicker;

pub trait ProviderFactory: Send + Sync {
    /// Checks up front that `config` can be built. Called once per provider
    /// when the orchestrator is created.
    fn supports(&self, config: &ProviderConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    fn build(
        &self,
        config: &ProviderConfig,
        tickers: Vec<ProviderTicker>,
    ) -> Result<Arc<dyn PriceProvider>>;
}

/// Builds the adapters shipped with the side-car.
#[derive(Debug, Default, Clone)]
pub struct DefaultProviderFactory;

impl DefaultProviderFactory {
    pub fn new() -> Self {
        Self
    }

    fn expected_kind(name: &str) -> Option<ProviderKind> {
        match name {
            COINBASE_API_NAME => Some(ProviderKind::Api),
            BINANCE_WS_NAME => Some(ProviderKind::Websocket),
            _ => None,
        }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn supports(&self, config: &ProviderConfig) -> Result<()> {
        match Self::expected_kind(&config.name) {
            Some(kind) if kind == config.kind => Ok(()),
            Some(kind) => bail!(
                "provider {} is a {} provider but is configured as {}",
                config.name,
                kind,
                config.kind
            ),
            None => bail!("no adapter named {}", config.name),
        }
    }

    fn build(
        &self,
        config: &ProviderConfig,
        tickers: Vec<ProviderTicker>,
    ) -> Result<Arc<dyn PriceProvider>> {
        self.supports(config)?;

        let provider: Provider = match config.kind {
            ProviderKind::Api => {
                let api = config
                    .api
                    .clone()
                    .with_context(|| format!("provider {} has no api section", config.name))?;
                let requests = HttpRequestHandler::new(api.timeout())
                    .with_context(|| format!("provider {}", config.name))?;
                let data = CoinbaseApiHandler::new(api.url.as_deref());
                let handler = ApiQueryHandler::new(api, Arc::new(data), Arc::new(requests));
                Provider::new(config.name.clone(), config.kind, tickers, Arc::new(handler))
            }
            ProviderKind::Websocket => {
                let ws = config
                    .websocket
                    .clone()
                    .with_context(|| format!("provider {} has no websocket section", config.name))?;
                let buffer = ws.max_buffer_size;
                let handler = WebSocketQueryHandler::new(
                    ws,
                    Box::new(BinanceWsHandler::new()),
                    Arc::new(TungsteniteConnector),
                );
                Provider::new(config.name.clone(), config.kind, tickers, Arc::new(handler))
                    .with_response_buffer(buffer)
            }
        };
        Ok(Arc::new(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, WebSocketConfig};
    use tokio_test::{assert_err, assert_ok};

    fn config(name: &str, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind,
            enabled: true,
            api: Some(ApiConfig::default()),
            websocket: Some(WebSocketConfig {
                endpoints: vec!["wss://stream.binance.com:9443/ws".to_string()],
                ..WebSocketConfig::default()
            }),
        }
    }

    #[test]
    fn test_supports_known_adapters_only() {
        let factory = DefaultProviderFactory::new();
        assert_ok!(factory.supports(&config(COINBASE_API_NAME, ProviderKind::Api)));
        assert_ok!(factory.supports(&config(BINANCE_WS_NAME, ProviderKind::Websocket)));
        assert_err!(factory.supports(&config(COINBASE_API_NAME, ProviderKind::Websocket)));
        assert_err!(factory.supports(&config("kraken_api", ProviderKind::Api)));
    }

    #[tokio::test]
    async fn test_build_does_not_connect() {
        let factory = DefaultProviderFactory::new();
        let provider = assert_ok!(factory.build(
            &config(BINANCE_WS_NAME, ProviderKind::Websocket),
            vec![ProviderTicker::new("BTCUSDT")],
        ));
        assert_eq!(provider.name(), BINANCE_WS_NAME);
        assert_eq!(provider.kind(), ProviderKind::Websocket);
        assert!(!provider.is_running());
        assert!(provider.latest_prices().is_empty());
    }
}
