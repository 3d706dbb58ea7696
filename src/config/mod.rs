//! Configuration management for the oracle side-car
//!
//! Loads from config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Aggregation tick period in milliseconds
    pub update_interval_ms: u64,
    /// Quotes older than this at tick time are ignored
    pub max_price_age_ms: u64,
    /// JSON market map read at startup
    pub market_map_path: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

impl OracleConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn max_price_age(&self) -> Duration {
        Duration::from_millis(self.max_price_age_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Api,
    Websocket,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Api => write!(f, "api"),
            ProviderKind::Websocket => write!(f, "websocket"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name, also the adapter key
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("provider name must not be empty");
        }
        match self.kind {
            ProviderKind::Api => self
                .api
                .as_ref()
                .with_context(|| {
                    format!(
                        "provider {} is an api provider without an api section",
                        self.name
                    )
                })?
                .validate()
                .with_context(|| format!("provider {}", self.name)),
            ProviderKind::Websocket => self
                .websocket
                .as_ref()
                .with_context(|| {
                    format!(
                        "provider {} is a websocket provider without a websocket section",
                        self.name
                    )
                })?
                .validate()
                .with_context(|| format!("provider {}", self.name)),
        }
    }
}

/// Polling parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Time between polling cycles
    #[serde(default = "d_api_interval_ms")]
    pub interval_ms: u64,
    /// Per-request timeout, must be shorter than the interval
    #[serde(default = "d_api_timeout_ms")]
    pub timeout_ms: u64,
    /// Requests in flight at once
    #[serde(default = "d_max_queries")]
    pub max_queries: usize,
    /// Tickers per request (0 = all tickers in a single request)
    #[serde(default)]
    pub batch_size: usize,
    /// Base URL override for the adapter
    #[serde(default)]
    pub url: Option<String>,
}

impl ApiConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            bail!("api interval must be positive");
        }
        if self.timeout_ms == 0 {
            bail!("api timeout must be positive");
        }
        if self.timeout_ms >= self.interval_ms {
            bail!(
                "api timeout ({}ms) must be shorter than the interval ({}ms)",
                self.timeout_ms,
                self.interval_ms
            );
        }
        if self.max_queries == 0 {
            bail!("api max_queries must be at least 1");
        }
        Ok(())
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            interval_ms: d_api_interval_ms(),
            timeout_ms: d_api_timeout_ms(),
            max_queries: d_max_queries(),
            batch_size: 0,
            url: None,
        }
    }
}

/// Streaming parameters
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// URLs to connect to; connections are spread across them round-robin
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Capacity of each connection's outbound write queue
    #[serde(default = "d_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "d_reconnection_timeout_ms")]
    pub reconnection_timeout_ms: u64,
    #[serde(default = "d_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Heartbeat period (0 disables heartbeats)
    #[serde(default = "d_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "d_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "d_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Pause between consecutive writes on one connection
    #[serde(default = "d_write_interval_ms")]
    pub write_interval_ms: u64,
    /// Consecutive handler errors tolerated before reconnecting
    #[serde(default = "d_max_read_error_count")]
    pub max_read_error_count: usize,
    /// Tickers per connection (0 = unlimited)
    #[serde(default)]
    pub max_subscriptions_per_connection: usize,
    /// Tickers per subscribe message
    #[serde(default = "d_max_subscriptions_per_batch")]
    pub max_subscriptions_per_batch: usize,
}

impl WebSocketConfig {
    pub fn reconnection_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnection_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            bail!("websocket provider needs at least one endpoint");
        }
        if self.endpoints.iter().any(|e| e.is_empty()) {
            bail!("websocket endpoint must not be empty");
        }
        if self.max_buffer_size == 0 {
            bail!("websocket max_buffer_size must be at least 1");
        }
        if self.reconnection_timeout_ms == 0 {
            bail!("websocket reconnection timeout must be positive");
        }
        if self.handshake_timeout_ms == 0 {
            bail!("websocket handshake timeout must be positive");
        }
        if self.read_timeout_ms == 0 {
            bail!("websocket read timeout must be positive");
        }
        if self.write_timeout_ms == 0 {
            bail!("websocket write timeout must be positive");
        }
        if self.ping_interval_ms > 0 && self.ping_interval_ms >= self.read_timeout_ms {
            bail!("websocket ping interval must be shorter than the read timeout");
        }
        if self.max_read_error_count == 0 {
            bail!("websocket max_read_error_count must be at least 1");
        }
        if self.max_subscriptions_per_batch == 0 {
            bail!("websocket max_subscriptions_per_batch must be at least 1");
        }
        Ok(())
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_buffer_size: d_max_buffer_size(),
            reconnection_timeout_ms: d_reconnection_timeout_ms(),
            handshake_timeout_ms: d_handshake_timeout_ms(),
            ping_interval_ms: d_ping_interval_ms(),
            read_timeout_ms: d_read_timeout_ms(),
            write_timeout_ms: d_write_timeout_ms(),
            write_interval_ms: d_write_interval_ms(),
            max_read_error_count: d_max_read_error_count(),
            max_subscriptions_per_connection: 0,
            max_subscriptions_per_batch: d_max_subscriptions_per_batch(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn d_api_interval_ms() -> u64 {
    1_000
}

fn d_api_timeout_ms() -> u64 {
    500
}

fn d_max_queries() -> usize {
    1
}

fn d_max_buffer_size() -> usize {
    1_024
}

fn d_reconnection_timeout_ms() -> u64 {
    10_000
}

fn d_handshake_timeout_ms() -> u64 {
    45_000
}

fn d_ping_interval_ms() -> u64 {
    0
}

fn d_read_timeout_ms() -> u64 {
    45_000
}

fn d_write_timeout_ms() -> u64 {
    45_000
}

fn d_write_interval_ms() -> u64 {
    100
}

fn d_max_read_error_count() -> usize {
    100
}

fn d_max_subscriptions_per_batch() -> usize {
    1
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("oracle.update_interval_ms", 500)?
            .set_default("oracle.max_price_age_ms", 120_000)?
            .set_default("oracle.market_map_path", "config/market_map.json")?
            .set_default("oracle.log_json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLE__*)
            .add_source(Environment::with_prefix("ORACLE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.oracle.update_interval_ms == 0 {
            bail!("oracle.update_interval_ms must be positive");
        }
        if self.oracle.max_price_age_ms == 0 {
            bail!("oracle.max_price_age_ms must be positive");
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                bail!("provider {} is configured more than once", provider.name);
            }
            provider.validate()?;
        }
        Ok(())
    }

    /// Providers that should be run.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        let providers: Vec<String> = self
            .enabled_providers()
            .map(|p| format!("{}({})", p.name, p.kind))
            .collect();
        format!(
            "update_interval={}ms max_price_age={}ms market_map={} providers={:?}",
            self.oracle.update_interval_ms,
            self.oracle.max_price_age_ms,
            self.oracle.market_map_path,
            providers
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> OracleConfig {
        OracleConfig {
            update_interval_ms: 500,
            max_price_age_ms: 120_000,
            market_map_path: "config/market_map.json".to_string(),
            log_json: false,
        }
    }

    fn api_provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::Api,
            enabled: true,
            api: Some(ApiConfig::default()),
            websocket: None,
        }
    }

    #[test]
    fn test_valid_config() {
        let cfg = AppConfig {
            oracle: oracle(),
            providers: vec![api_provider("coinbase_api")],
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.digest().contains("coinbase_api(api)"));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let cfg = AppConfig {
            oracle: oracle(),
            providers: vec![api_provider("a"), api_provider("a")],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut provider = api_provider("binance_ws");
        provider.kind = ProviderKind::Websocket;
        assert!(provider.validate().is_err());
    }

    #[test]
    fn test_api_timeout_must_fit_interval() {
        let api = ApiConfig {
            interval_ms: 500,
            timeout_ms: 500,
            ..ApiConfig::default()
        };
        assert!(api.validate().is_err());
    }

    #[test]
    fn test_websocket_bounds() {
        let mut ws = WebSocketConfig {
            endpoints: vec!["wss://example.com".to_string()],
            ..WebSocketConfig::default()
        };
        assert!(ws.validate().is_ok());
        assert_eq!(ws.ping_interval(), None);

        ws.max_subscriptions_per_batch = 0;
        assert!(ws.validate().is_err());

        ws.max_subscriptions_per_batch = 1;
        ws.endpoints.clear();
        assert!(ws.validate().is_err());
    }

    #[test]
    fn test_deserialize_provider_defaults() {
        let raw = serde_json::json!({
            "name": "binance_ws",
            "kind": "websocket",
            "websocket": { "endpoints": ["wss://stream.binance.com:9443/ws"] }
        });
        let provider: ProviderConfig = serde_json::from_value(raw).unwrap();
        assert!(provider.enabled);
        let ws = provider.websocket.as_ref().unwrap();
        assert_eq!(ws.max_subscriptions_per_batch, 1);
        assert_eq!(ws.reconnection_timeout(), Duration::from_secs(10));
        assert!(provider.validate().is_ok());
    }
}
