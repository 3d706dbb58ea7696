//! Provider runner - one per configured provider
//!
//! Owns the price cache and the two tasks that keep it fresh: the
//! transport-specific query task and the receive loop that merges every
//! response the query task produces into the cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    MetricsSnapshot, PriceCache, PriceProvider, ProviderError, ProviderMetrics, ProviderResult,
    QueryContext, QueryHandler,
};
use crate::config::ProviderKind;
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::types::{PriceResponse, PriceResult, ProviderTicker};

const DEFAULT_RESPONSE_BUFFER: usize = 1_024;

struct RunningTasks {
    trigger: ShutdownTrigger,
    query: JoinHandle<()>,
    receive: JoinHandle<()>,
}

pub struct Provider {
    name: String,
    kind: ProviderKind,
    tickers: Vec<ProviderTicker>,
    handler: Arc<dyn QueryHandler>,
    cache: Arc<PriceCache>,
    metrics: Arc<ProviderMetrics>,
    response_buffer: usize,
    running: AtomicBool,
    tasks: Mutex<Option<RunningTasks>>,
}

impl Provider {
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        tickers: Vec<ProviderTicker>,
        handler: Arc<dyn QueryHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            tickers,
            handler,
            cache: Arc::new(PriceCache::new()),
            metrics: Arc::new(ProviderMetrics::default()),
            response_buffer: DEFAULT_RESPONSE_BUFFER,
            running: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }
    }

    pub fn with_response_buffer(mut self, size: usize) -> Self {
        self.response_buffer = size.max(1);
        self
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    async fn receive_loop(
        name: String,
        mut rx: mpsc::Receiver<PriceResponse>,
        cache: Arc<PriceCache>,
        metrics: Arc<ProviderMetrics>,
        shutdown: ShutdownSignal,
    ) {
        loop {
            let response = tokio::select! {
                _ = shutdown.recv() => break,
                response = rx.recv() => match response {
                    Some(response) => response,
                    None => break,
                },
            };

            ProviderMetrics::incr(&metrics.responses);
            for (ticker, result) in &response.unresolved {
                debug!(
                    provider = %name,
                    ticker = %ticker,
                    kind = %result.kind,
                    cause = %result.cause,
                    "Unresolved ticker"
                );
            }
            let update = cache.apply(response);
            metrics
                .resolved
                .fetch_add(update.updated as u64, Ordering::Relaxed);
            metrics
                .unresolved
                .fetch_add(update.unresolved as u64, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl PriceProvider for Provider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn tickers(&self) -> Vec<ProviderTicker> {
        self.tickers.clone()
    }

    async fn start(&self, shutdown: ShutdownSignal) -> ProviderResult<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(running) = tasks.take() {
            if !running.query.is_finished() {
                *tasks = Some(running);
                return Ok(());
            }
            // Query task exited on its own; reap the receive loop before relaunching.
            running.trigger.shutdown();
            let _ = running.receive.await;
        }
        if self.tickers.is_empty() {
            return Err(ProviderError::Configuration(format!(
                "provider {} has no tickers to fetch",
                self.name
            )));
        }
        if shutdown.is_shutdown() {
            return Err(ProviderError::Closed);
        }

        let (trigger, signal) = shutdown.child();
        let (tx, rx) = mpsc::channel(self.response_buffer);
        let ctx = QueryContext {
            provider: self.name.clone(),
            responses: tx,
            shutdown: signal.clone(),
            metrics: self.metrics.clone(),
        };

        let handler = self.handler.clone();
        let tickers = self.tickers.clone();
        let query = tokio::spawn(async move { handler.run(tickers, ctx).await });
        let receive = tokio::spawn(Self::receive_loop(
            self.name.clone(),
            rx,
            self.cache.clone(),
            self.metrics.clone(),
            signal,
        ));

        *tasks = Some(RunningTasks {
            trigger,
            query,
            receive,
        });
        self.running.store(true, Ordering::SeqCst);

        info!(
            provider = %self.name,
            kind = %self.kind,
            tickers = self.tickers.len(),
            "▶️ Provider started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some(running) = tasks.take() else {
            return;
        };

        running.trigger.shutdown();
        if let Err(e) = running.query.await {
            warn!(provider = %self.name, error = %e, "Query task ended abnormally");
        }
        if let Err(e) = running.receive.await {
            warn!(provider = %self.name, error = %e, "Receive task ended abnormally");
        }

        self.cache.clear();
        self.running.store(false, Ordering::SeqCst);

        let metrics = self.metrics.snapshot();
        info!(
            provider = %self.name,
            responses = metrics.responses,
            resolved = metrics.resolved,
            unresolved = metrics.unresolved,
            reconnects = metrics.reconnects,
            "⏹️ Provider stopped"
        );
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn latest_prices(&self) -> HashMap<ProviderTicker, PriceResult> {
        self.cache.prices()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
