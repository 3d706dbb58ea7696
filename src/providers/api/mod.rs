//! Polling runner
//!
//! Every `interval` the assigned tickers are split into batches, each batch
//! becomes one request, and at most `max_queries` requests are in flight at
//! once. A failed or slow request only marks its own batch unresolved.

mod http;

pub use http::HttpRequestHandler;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{ProviderError, ProviderResult, QueryContext, QueryHandler};
use crate::config::ApiConfig;
use crate::types::{ErrorKind, PriceResponse, ProviderTicker};

/// Status code and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport seam for the polling runner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn do_request(&self, url: &str) -> ProviderResult<RawResponse>;
}

/// Exchange-specific half of a polling provider.
pub trait ApiDataHandler: Send + Sync {
    /// Builds the request URL for one batch of tickers.
    fn create_url(&self, tickers: &[ProviderTicker]) -> ProviderResult<String>;

    /// Turns a successful response into resolved/unresolved results. Tickers
    /// the parser leaves out are marked `NoResponse` by the runner.
    fn parse_response(&self, tickers: &[ProviderTicker], response: &RawResponse) -> PriceResponse;

    /// Largest batch the endpoint accepts, if it has a limit.
    fn max_batch_size(&self) -> Option<usize> {
        None
    }
}

pub struct ApiQueryHandler {
    config: ApiConfig,
    data: Arc<dyn ApiDataHandler>,
    requests: Arc<dyn RequestHandler>,
}

impl ApiQueryHandler {
    pub fn new(
        config: ApiConfig,
        data: Arc<dyn ApiDataHandler>,
        requests: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            config,
            data,
            requests,
        }
    }

    fn batches(&self, tickers: &[ProviderTicker]) -> Vec<Vec<ProviderTicker>> {
        let mut size = match self.config.batch_size {
            0 => tickers.len(),
            n => n,
        };
        if let Some(limit) = self.data.max_batch_size() {
            size = size.min(limit);
        }
        tickers
            .chunks(size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    async fn fetch(&self, provider: &str, batch: Vec<ProviderTicker>) -> PriceResponse {
        let url = match self.data.create_url(&batch) {
            Ok(url) => url,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Failed to build request");
                return PriceResponse::all_unresolved(&batch, e.kind(), e.to_string());
            }
        };

        let timeout = self.config.timeout();
        let response = match tokio::time::timeout(timeout, self.requests.do_request(&url)).await {
            Err(_) => {
                warn!(
                    provider = %provider,
                    tickers = batch.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "⏱️ Request timed out"
                );
                return PriceResponse::all_unresolved(
                    &batch,
                    ErrorKind::Timeout,
                    format!("request timed out after {}ms", timeout.as_millis()),
                );
            }
            Ok(Err(e)) => {
                warn!(provider = %provider, error = %e, "Request failed");
                let kind = match e {
                    ProviderError::Timeout(_) => ErrorKind::Timeout,
                    ProviderError::RateLimit(_) => ErrorKind::RateLimit,
                    _ => ErrorKind::ApiGeneral,
                };
                return PriceResponse::all_unresolved(&batch, kind, e.to_string());
            }
            Ok(Ok(response)) => response,
        };

        if response.status == 429 {
            warn!(provider = %provider, "Rate limited");
            return PriceResponse::all_unresolved(&batch, ErrorKind::RateLimit, "status 429");
        }
        if !response.is_success() {
            warn!(provider = %provider, status = response.status, "Unexpected status");
            return PriceResponse::all_unresolved(
                &batch,
                ErrorKind::ApiGeneral,
                format!("status {}", response.status),
            );
        }

        self.data.parse_response(&batch, &response).complete(&batch)
    }
}

#[async_trait]
impl QueryHandler for ApiQueryHandler {
    async fn run(&self, tickers: Vec<ProviderTicker>, ctx: QueryContext) {
        let batches = self.batches(&tickers);
        let max_queries = self.config.max_queries.max(1);
        info!(
            provider = %ctx.provider,
            tickers = tickers.len(),
            batches = batches.len(),
            max_queries,
            interval_ms = self.config.interval_ms,
            "Polling started"
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            let mut cycle = stream::iter(batches.iter().cloned())
                .map(|batch| self.fetch(&ctx.provider, batch))
                .buffer_unordered(max_queries);

            loop {
                let response = tokio::select! {
                    _ = ctx.shutdown.recv() => {
                        debug!(provider = %ctx.provider, "Polling cycle interrupted by shutdown");
                        return;
                    }
                    response = cycle.next() => match response {
                        Some(response) => response,
                        None => break,
                    },
                };
                if ctx.responses.send(response).await.is_err() {
                    return;
                }
            }
        }

        debug!(provider = %ctx.provider, "Polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderMetrics;
    use crate::shutdown;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::types::PriceResult;

    /// Queries `?symbols=A,B` and reads `{"A": "1.0", ...}`.
    struct JsonPrices {
        max_batch: Option<usize>,
    }

    impl ApiDataHandler for JsonPrices {
        fn create_url(&self, tickers: &[ProviderTicker]) -> ProviderResult<String> {
            let symbols: Vec<&str> = tickers.iter().map(|t| t.off_chain_ticker.as_str()).collect();
            Ok(format!("http://prices.test/v1?symbols={}", symbols.join(",")))
        }

        fn parse_response(
            &self,
            tickers: &[ProviderTicker],
            response: &RawResponse,
        ) -> PriceResponse {
            let mut out = PriceResponse::default();
            let Ok(body) = serde_json::from_str::<HashMap<String, String>>(&response.body) else {
                return PriceResponse::all_unresolved(tickers, ErrorKind::ParseError, "bad body");
            };
            for ticker in tickers {
                if let Some(value) = body.get(&ticker.off_chain_ticker) {
                    match Decimal::from_str(value) {
                        Ok(value) => {
                            out.insert_resolved(ticker.clone(), PriceResult::new(value, Utc::now()))
                        }
                        Err(e) => out.insert_unresolved(
                            ticker.clone(),
                            crate::types::UnresolvedResult::new(
                                ErrorKind::ParseError,
                                e.to_string(),
                            ),
                        ),
                    }
                }
            }
            out
        }

        fn max_batch_size(&self) -> Option<usize> {
            self.max_batch
        }
    }

    fn api_config(batch_size: usize, max_queries: usize) -> ApiConfig {
        ApiConfig {
            interval_ms: 1_000,
            timeout_ms: 100,
            max_queries,
            batch_size,
            url: None,
        }
    }

    fn tickers(symbols: &[&str]) -> Vec<ProviderTicker> {
        symbols.iter().map(|s| ProviderTicker::new(*s)).collect()
    }

    /// Runs one polling cycle and returns everything it produced.
    async fn run_one_cycle(
        handler: ApiQueryHandler,
        tickers: Vec<ProviderTicker>,
    ) -> Vec<PriceResponse> {
        let (trigger, signal) = shutdown::channel();
        let (tx, mut rx) = mpsc::channel(64);
        let ctx = QueryContext {
            provider: "test_api".to_string(),
            responses: tx,
            shutdown: signal,
            metrics: Arc::new(ProviderMetrics::default()),
        };
        let expected = handler.batches(&tickers).len();
        let task = tokio::spawn(async move { handler.run(tickers, ctx).await });

        let mut responses = Vec::new();
        while responses.len() < expected {
            let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("cycle should finish")
                .expect("runner dropped the channel");
            responses.push(response);
        }
        trigger.shutdown();
        task.await.unwrap();
        responses
    }

    #[tokio::test]
    async fn test_successful_cycle_resolves_every_ticker() {
        let mut requests = MockRequestHandler::new();
        requests
            .expect_do_request()
            .times(1)
            .returning(|_| Ok(RawResponse::ok(r#"{"BTC-USD":"64000.5","ETH-USD":"2000"}"#)));

        let handler = ApiQueryHandler::new(
            api_config(0, 1),
            Arc::new(JsonPrices { max_batch: None }),
            Arc::new(requests),
        );
        let responses = run_one_cycle(handler, tickers(&["BTC-USD", "ETH-USD", "SOL-USD"])).await;

        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert_eq!(response.resolved[&ProviderTicker::new("BTC-USD")].value, dec!(64000.5));
        assert_eq!(response.resolved[&ProviderTicker::new("ETH-USD")].value, dec!(2000));
        assert_eq!(
            response.unresolved[&ProviderTicker::new("SOL-USD")].kind,
            ErrorKind::NoResponse
        );
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size_and_adapter_limit() {
        let mut requests = MockRequestHandler::new();
        requests
            .expect_do_request()
            .times(3)
            .returning(|_| Ok(RawResponse::ok("{}")));

        let handler = ApiQueryHandler::new(
            api_config(5, 2),
            Arc::new(JsonPrices { max_batch: Some(2) }),
            Arc::new(requests),
        );
        let responses = run_one_cycle(handler, tickers(&["A", "B", "C", "D", "E"])).await;

        assert_eq!(responses.len(), 3);
        let total: usize = responses.iter().map(PriceResponse::len).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_error_status_marks_only_that_batch() {
        let mut requests = MockRequestHandler::new();
        requests.expect_do_request().times(2).returning(|url| {
            if url.contains("BAD") {
                Ok(RawResponse {
                    status: 429,
                    body: String::new(),
                })
            } else {
                Ok(RawResponse::ok(r#"{"GOOD":"1"}"#))
            }
        });

        let handler = ApiQueryHandler::new(
            api_config(1, 2),
            Arc::new(JsonPrices { max_batch: None }),
            Arc::new(requests),
        );
        let responses = run_one_cycle(handler, tickers(&["GOOD", "BAD"])).await;

        let merged = responses
            .into_iter()
            .fold(PriceResponse::default(), |mut acc, r| {
                acc.resolved.extend(r.resolved);
                acc.unresolved.extend(r.unresolved);
                acc
            });
        assert!(merged.resolved.contains_key(&ProviderTicker::new("GOOD")));
        assert_eq!(
            merged.unresolved[&ProviderTicker::new("BAD")].kind,
            ErrorKind::RateLimit
        );
    }

    struct SlowRequests;

    #[async_trait]
    impl RequestHandler for SlowRequests {
        async fn do_request(&self, _url: &str) -> ProviderResult<RawResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RawResponse::ok("{}"))
        }
    }

    #[tokio::test]
    async fn test_timeout_marks_batch_unresolved() {
        let handler = ApiQueryHandler::new(
            api_config(0, 1),
            Arc::new(JsonPrices { max_batch: None }),
            Arc::new(SlowRequests),
        );
        let responses = run_one_cycle(handler, tickers(&["BTC-USD"])).await;
        assert_eq!(
            responses[0].unresolved[&ProviderTicker::new("BTC-USD")].kind,
            ErrorKind::Timeout
        );
    }

    #[tokio::test]
    async fn test_transport_error_maps_to_api_general() {
        let mut requests = MockRequestHandler::new();
        requests
            .expect_do_request()
            .returning(|_| Err(ProviderError::Request("connection refused".to_string())));

        let handler = ApiQueryHandler::new(
            api_config(0, 1),
            Arc::new(JsonPrices { max_batch: None }),
            Arc::new(requests),
        );
        let responses = run_one_cycle(handler, tickers(&["BTC-USD"])).await;
        assert_eq!(
            responses[0].unresolved[&ProviderTicker::new("BTC-USD")].kind,
            ErrorKind::ApiGeneral
        );
    }
}
