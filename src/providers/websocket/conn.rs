//! Socket seam for the streaming runner
//!
//! The runner sees [`Frame`]s. Control frames are answered by tungstenite
//! itself; they only tell the read loop the connection is alive and never
//! reach the data handler.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::providers::{ProviderError, ProviderResult};

/// Write half of one connection.
#[async_trait]
pub trait WsSink: Send {
    async fn send(&mut self, message: String) -> ProviderResult<()>;

    async fn close(&mut self);
}

/// One inbound frame as the read loop sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Data frame that could not be decoded. Counts as a read error.
    Malformed(String),
    /// Ping/Pong keepalive
    Control,
}

/// Read half of one connection. `None` means the stream ended; `Err` is a
/// transport failure.
#[async_trait]
pub trait WsSource: Send {
    async fn next_message(&mut self) -> Option<ProviderResult<Frame>>;
}

#[async_trait]
pub trait WebSocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> ProviderResult<(Box<dyn WsSink>, Box<dyn WsSource>)>;
}

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials real endpoints with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

struct TungsteniteSink(SplitSink<Stream, Message>);

struct TungsteniteSource(SplitStream<Stream>);

#[async_trait]
impl WebSocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> ProviderResult<(Box<dyn WsSink>, Box<dyn WsSource>)> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ProviderError::Connection(format!("{}: {}", url, e)))?;
        let (write, read) = stream.split();
        Ok((
            Box::new(TungsteniteSink(write)),
            Box::new(TungsteniteSource(read)),
        ))
    }
}

#[async_trait]
impl WsSink for TungsteniteSink {
    async fn send(&mut self, message: String) -> ProviderResult<()> {
        self.0
            .send(Message::Text(message))
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not sent");
        }
        if let Err(e) = self.0.close().await {
            debug!(error = %e, "Socket close failed");
        }
    }
}

#[async_trait]
impl WsSource for TungsteniteSource {
    async fn next_message(&mut self) -> Option<ProviderResult<Frame>> {
        let frame = match self.0.next().await? {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => Frame::Text(text),
                Err(e) => Frame::Malformed(format!("non-utf8 binary frame: {}", e)),
            },
            Ok(Message::Close(_)) => return Some(Err(ProviderError::Closed)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Frame::Control,
            Err(e) => return Some(Err(ProviderError::Connection(e.to_string()))),
        };
        Some(Ok(frame))
    }
}
