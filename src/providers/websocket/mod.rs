//! Streaming runner
//!
//! Tickers are spread over one or more persistent connections. Each
//! connection runs its own generation loop:
//!
//! 1. dial the endpoint (bounded by the handshake timeout)
//! 2. subscribe in batches of `max_subscriptions_per_batch`
//! 3. read until the read timeout expires, the stream ends, or
//!    `max_read_error_count` frames in a row are malformed or rejected by
//!    the data handler (keepalive frames reset the read timeout)
//! 4. tear everything down, wait `reconnection_timeout`, start over with a
//!    fresh handler copy and the same ticker set
//!
//! All writes on a connection go through one bounded queue drained by a
//! single writer task. When that queue is full the message is dropped.

mod conn;

pub use conn::{Frame, TungsteniteConnector, WebSocketConnector, WsSink, WsSource};

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{ProviderError, ProviderMetrics, ProviderResult, QueryContext, QueryHandler};
use crate::config::WebSocketConfig;
use crate::shutdown::ShutdownSignal;
use crate::types::{ErrorKind, PriceResponse, ProviderTicker};

/// Exchange-specific half of a streaming provider.
pub trait WebSocketDataHandler: Send + Sync {
    /// Parses one inbound message into price updates plus any replies that
    /// must be written back (pongs, resubscribes).
    fn handle_message(&mut self, message: &str) -> ProviderResult<(PriceResponse, Vec<String>)>;

    /// Subscribe messages for one batch of tickers.
    fn create_messages(&mut self, tickers: &[ProviderTicker]) -> ProviderResult<Vec<String>>;

    /// Messages sent on every heartbeat tick. Empty means no heartbeat.
    fn heartbeat_messages(&self) -> Vec<String>;

    /// A fresh handler with empty subscription and sequence state.
    fn copy(&self) -> Box<dyn WebSocketDataHandler>;
}

pub struct WebSocketQueryHandler {
    config: WebSocketConfig,
    handler: Box<dyn WebSocketDataHandler>,
    connector: Arc<dyn WebSocketConnector>,
}

impl WebSocketQueryHandler {
    pub fn new(
        config: WebSocketConfig,
        handler: Box<dyn WebSocketDataHandler>,
        connector: Arc<dyn WebSocketConnector>,
    ) -> Self {
        Self {
            config,
            handler,
            connector,
        }
    }
}

/// Splits tickers into per-connection groups (0 = one connection).
fn partition(tickers: Vec<ProviderTicker>, per_connection: usize) -> Vec<Vec<ProviderTicker>> {
    if tickers.is_empty() {
        return Vec::new();
    }
    if per_connection == 0 || per_connection >= tickers.len() {
        return vec![tickers];
    }
    tickers
        .chunks(per_connection)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Queues a message without ever waiting. Returns `false` once the writer
/// is gone.
fn enqueue(
    queue: &mpsc::Sender<String>,
    message: String,
    provider: &str,
    metrics: &ProviderMetrics,
) -> bool {
    match queue.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            ProviderMetrics::incr(&metrics.dropped_writes);
            warn!(provider = %provider, "Write queue full, dropping outbound message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl QueryHandler for WebSocketQueryHandler {
    async fn run(&self, tickers: Vec<ProviderTicker>, ctx: QueryContext) {
        if self.config.endpoints.is_empty() {
            warn!(provider = %ctx.provider, "No websocket endpoints configured");
            let _ = ctx
                .responses
                .send(PriceResponse::all_unresolved(
                    &tickers,
                    ErrorKind::WebSocketGeneral,
                    "no endpoints configured",
                ))
                .await;
            return;
        }

        let groups = partition(tickers, self.config.max_subscriptions_per_connection);
        info!(
            provider = %ctx.provider,
            connections = groups.len(),
            endpoints = self.config.endpoints.len(),
            "Streaming started"
        );

        let tasks: Vec<JoinHandle<()>> = groups
            .into_iter()
            .enumerate()
            .map(|(id, tickers)| {
                let connection = Connection {
                    id,
                    endpoint: self.config.endpoints[id % self.config.endpoints.len()].clone(),
                    tickers,
                    config: self.config.clone(),
                    template: self.handler.copy(),
                    connector: self.connector.clone(),
                    ctx: ctx.clone(),
                };
                tokio::spawn(connection.run())
            })
            .collect();

        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(provider = %ctx.provider, error = %e, "Connection task ended abnormally");
            }
        }
        debug!(provider = %ctx.provider, "Streaming stopped");
    }
}

enum Exit {
    Shutdown,
    Reconnect(&'static str),
}

struct Connection {
    id: usize,
    endpoint: String,
    tickers: Vec<ProviderTicker>,
    config: WebSocketConfig,
    template: Box<dyn WebSocketDataHandler>,
    connector: Arc<dyn WebSocketConnector>,
    ctx: QueryContext,
}

impl Connection {
    async fn run(self) {
        let mut attempt: u64 = 0;
        loop {
            let reason = match self.run_generation().await {
                Exit::Shutdown => break,
                Exit::Reconnect(reason) => reason,
            };
            if self.ctx.shutdown.is_shutdown() || self.ctx.responses.is_closed() {
                break;
            }

            attempt += 1;
            ProviderMetrics::incr(&self.ctx.metrics.reconnects);
            warn!(
                provider = %self.ctx.provider,
                connection = self.id,
                reason,
                attempt,
                delay_ms = self.config.reconnection_timeout_ms,
                "🔄 Reconnect scheduled"
            );
            if !self.ctx.shutdown.sleep(self.config.reconnection_timeout()).await {
                break;
            }
        }
        debug!(provider = %self.ctx.provider, connection = self.id, "Connection loop exited");
    }

    async fn report_unresolved(&self, tickers: &[ProviderTicker], kind: ErrorKind, cause: String) {
        let response = PriceResponse::all_unresolved(tickers, kind, cause);
        tokio::select! {
            _ = self.ctx.shutdown.recv() => {}
            _ = self.ctx.responses.send(response) => {}
        }
    }

    /// One connect/subscribe/read cycle.
    async fn run_generation(&self) -> Exit {
        let provider = self.ctx.provider.as_str();
        let mut handler = self.template.copy();

        ProviderMetrics::incr(&self.ctx.metrics.connection_attempts);
        info!(
            provider = %provider,
            connection = self.id,
            endpoint = %self.endpoint,
            tickers = self.tickers.len(),
            "Connecting..."
        );

        let dial = tokio::select! {
            _ = self.ctx.shutdown.recv() => return Exit::Shutdown,
            dial = tokio::time::timeout(
                self.config.handshake_timeout(),
                self.connector.connect(&self.endpoint),
            ) => dial,
        };
        let (sink, mut source) = match dial {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                warn!(provider = %provider, connection = self.id, error = %e, "Connection failed");
                self.report_unresolved(&self.tickers, e.kind(), e.to_string()).await;
                return Exit::Reconnect("dial_failed");
            }
            Err(_) => {
                warn!(provider = %provider, connection = self.id, "Handshake timed out");
                self.report_unresolved(
                    &self.tickers,
                    ErrorKind::Timeout,
                    format!("handshake timed out after {}ms", self.config.handshake_timeout_ms),
                )
                .await;
                return Exit::Reconnect("handshake_timeout");
            }
        };

        let (generation_trigger, generation) = self.ctx.shutdown.child();
        let (queue, queue_rx) = mpsc::channel::<String>(self.config.max_buffer_size.max(1));
        let mut writer = tokio::spawn(write_loop(
            provider.to_string(),
            sink,
            queue_rx,
            self.config.write_timeout(),
            self.config.write_interval(),
            generation.clone(),
        ));
        let mut writer_finished = false;

        let exit = 'generation: {
            // Subscribe
            let batch = self.config.max_subscriptions_per_batch.max(1);
            for chunk in self.tickers.chunks(batch) {
                let messages = match handler.create_messages(chunk) {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(
                            provider = %provider,
                            connection = self.id,
                            error = %e,
                            "Failed to build subscription"
                        );
                        self.report_unresolved(chunk, e.kind(), e.to_string()).await;
                        break 'generation Exit::Reconnect("subscribe_failed");
                    }
                };
                for message in messages {
                    let queued = tokio::select! {
                        _ = self.ctx.shutdown.recv() => break 'generation Exit::Shutdown,
                        sent = tokio::time::timeout(
                            self.config.write_timeout(),
                            queue.send(message),
                        ) => sent,
                    };
                    if !matches!(queued, Ok(Ok(()))) {
                        warn!(
                            provider = %provider,
                            connection = self.id,
                            "Failed to queue subscription"
                        );
                        break 'generation Exit::Reconnect("subscribe_failed");
                    }
                }
            }
            info!(
                provider = %provider,
                connection = self.id,
                tickers = self.tickers.len(),
                "✅ Subscribed"
            );

            let heartbeat = match self.config.ping_interval() {
                Some(period) => {
                    let messages = handler.heartbeat_messages();
                    (!messages.is_empty()).then(|| {
                        tokio::spawn(heartbeat_loop(
                            provider.to_string(),
                            messages,
                            period,
                            queue.clone(),
                            self.ctx.metrics.clone(),
                            generation.clone(),
                        ))
                    })
                }
                None => None,
            };

            let exit = self
                .read_loop(
                    handler.as_mut(),
                    source.as_mut(),
                    &queue,
                    &mut writer,
                    &mut writer_finished,
                )
                .await;

            generation_trigger.shutdown();
            if let Some(heartbeat) = heartbeat {
                let _ = heartbeat.await;
            }
            exit
        };

        generation_trigger.shutdown();
        drop(queue);
        if !writer_finished {
            let _ = writer.await;
        }
        drop(source);
        exit
    }

    async fn read_loop(
        &self,
        handler: &mut dyn WebSocketDataHandler,
        source: &mut dyn WsSource,
        queue: &mpsc::Sender<String>,
        writer: &mut JoinHandle<()>,
        writer_finished: &mut bool,
    ) -> Exit {
        let provider = self.ctx.provider.as_str();
        let metrics = &self.ctx.metrics;
        let read_timeout = self.config.read_timeout();
        let mut consecutive_errors = 0usize;

        loop {
            let next = tokio::select! {
                _ = self.ctx.shutdown.recv() => return Exit::Shutdown,
                _ = &mut *writer, if !*writer_finished => {
                    *writer_finished = true;
                    warn!(provider = %provider, connection = self.id, "Writer stopped");
                    return Exit::Reconnect("write_failed");
                }
                next = tokio::time::timeout(read_timeout, source.next_message()) => next,
            };

            let outcome = match next {
                Err(_) => {
                    warn!(
                        provider = %provider,
                        connection = self.id,
                        timeout_ms = self.config.read_timeout_ms,
                        "No data within read timeout"
                    );
                    return Exit::Reconnect("read_timeout");
                }
                Ok(None) => {
                    info!(provider = %provider, connection = self.id, "Stream ended");
                    return Exit::Reconnect("stream_ended");
                }
                Ok(Some(Err(e))) => {
                    warn!(provider = %provider, connection = self.id, error = %e, "Stream error");
                    return Exit::Reconnect("stream_error");
                }
                Ok(Some(Ok(Frame::Control))) => continue,
                Ok(Some(Ok(Frame::Malformed(cause)))) => Err(ProviderError::Parse(cause)),
                Ok(Some(Ok(Frame::Text(text)))) => handler.handle_message(&text),
            };

            match outcome {
                Ok((response, replies)) => {
                    consecutive_errors = 0;
                    for reply in replies {
                        if !enqueue(queue, reply, provider, metrics) {
                            return Exit::Reconnect("write_failed");
                        }
                    }
                    if !response.is_empty() && self.ctx.responses.send(response).await.is_err() {
                        return Exit::Shutdown;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    ProviderMetrics::incr(&metrics.read_errors);
                    debug!(
                        provider = %provider,
                        connection = self.id,
                        error = %e,
                        consecutive_errors,
                        "Failed to read message"
                    );
                    if consecutive_errors >= self.config.max_read_error_count {
                        warn!(
                            provider = %provider,
                            connection = self.id,
                            consecutive_errors,
                            "Too many consecutive read errors"
                        );
                        return Exit::Reconnect("max_read_errors");
                    }
                }
            }
        }
    }
}

/// Drains the outbound queue onto the socket, one message at a time.
async fn write_loop(
    provider: String,
    mut sink: Box<dyn WsSink>,
    mut queue: mpsc::Receiver<String>,
    write_timeout: Duration,
    write_interval: Duration,
    shutdown: ShutdownSignal,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.recv() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(provider = %provider, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                warn!(provider = %provider, "Write timed out");
                break;
            }
        }

        if !write_interval.is_zero() && !shutdown.sleep(write_interval).await {
            break;
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

async fn heartbeat_loop(
    provider: String,
    messages: Vec<String>,
    period: Duration,
    queue: mpsc::Sender<String>,
    metrics: Arc<ProviderMetrics>,
    shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                for message in &messages {
                    if !enqueue(&queue, message.clone(), &provider, &metrics) {
                        return;
                    }
                }
            }
        }
    }
}
