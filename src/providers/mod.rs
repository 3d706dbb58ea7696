//! Provider execution framework
//!
//! A provider is one exchange feed. Its [`Provider`] runner owns a
//! transport-specific [`QueryHandler`] (polling or streaming) plus the price
//! cache that handler keeps fresh. Everything exchange-specific lives behind
//! the adapter traits in [`api`] and [`websocket`].

pub mod adapters;
pub mod api;
mod base;
mod cache;
pub mod factory;
pub mod websocket;

pub use base::Provider;
pub use cache::PriceCache;
pub use factory::{DefaultProviderFactory, ProviderFactory};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ProviderKind;
use crate::shutdown::ShutdownSignal;
use crate::types::{ErrorKind, PriceResponse, PriceResult, ProviderTicker};

/// Provider error types
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection closed")]
    Closed,
}

impl ProviderError {
    /// The unresolved-result kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Connection(_) | ProviderError::Closed => ErrorKind::WebSocketGeneral,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Request(_) => ErrorKind::ApiGeneral,
            ProviderError::Parse(_) => ErrorKind::ParseError,
            ProviderError::RateLimit(_) => ErrorKind::RateLimit,
            ProviderError::Subscription(_) => ErrorKind::WebSocketGeneral,
            ProviderError::Configuration(_) => ErrorKind::Unknown,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Counters a runner keeps about its own activity.
#[derive(Debug, Default)]
pub struct ProviderMetrics {
    pub connection_attempts: AtomicU64,
    pub reconnects: AtomicU64,
    pub responses: AtomicU64,
    pub resolved: AtomicU64,
    pub unresolved: AtomicU64,
    pub read_errors: AtomicU64,
    pub dropped_writes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub reconnects: u64,
    pub responses: u64,
    pub resolved: u64,
    pub unresolved: u64,
    pub read_errors: u64,
    pub dropped_writes: u64,
}

impl ProviderMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

/// What a query handler needs from its runner.
#[derive(Clone)]
pub struct QueryContext {
    pub provider: String,
    pub responses: mpsc::Sender<PriceResponse>,
    pub shutdown: ShutdownSignal,
    pub metrics: Arc<ProviderMetrics>,
}

/// Transport loop that turns a ticker set into a stream of responses.
///
/// `run` returns only once `ctx.shutdown` fires (or the response channel
/// closes) and every task it spawned has exited.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn run(&self, tickers: Vec<ProviderTicker>, ctx: QueryContext);
}

/// The contract the orchestrator and aggregator see for every provider.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn tickers(&self) -> Vec<ProviderTicker>;

    /// Launches the runner's tasks. Calling it on a running provider is a no-op.
    async fn start(&self, shutdown: ShutdownSignal) -> ProviderResult<()>;

    /// Stops the runner and waits for all of its tasks to exit.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Latest observation per ticker.
    fn latest_prices(&self) -> HashMap<ProviderTicker, PriceResult>;

    fn metrics(&self) -> MetricsSnapshot;
}
