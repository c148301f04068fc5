//! The byte-stream boundary below the connection manager, plus the
//! WebSocket implementation used by the binaries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};
use url::Url;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    /// Unsolicited closure. Nothing follows it.
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&self);
}

/// An open transport together with its inbound side.
pub struct TransportSession {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self) -> Result<TransportSession, TransportError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketConnector {
    url: Url,
    auth_token: Option<String>,
}

impl WebSocketConnector {
    /// Accepts `ws(s)://` URLs as well as `http(s)://` server URLs, which are
    /// mapped onto the matching WebSocket scheme.
    pub fn new(server_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
            server_url.to_string()
        } else {
            anyhow::bail!("server_url must start with ws://, wss://, http:// or https://");
        };
        Ok(Self {
            url: Url::parse(&ws_url)?,
            auth_token,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn open(&self) -> Result<TransportSession, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Connect(format!("invalid auth token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        info!(url = %self.url, "transport: websocket open");

        let (sink, mut reader) = ws_stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let pump = tokio::spawn(async move {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx
                            .send(TransportEvent::Frame(text.into_bytes()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if inbound_tx.send(TransportEvent::Frame(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| {
                                format!("closed by server ({}) {}", u16::from(frame.code), frame.reason)
                            })
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            };
            debug!(%reason, "transport: websocket reader finished");
            let _ = inbound_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(TransportSession {
            transport: Arc::new(WebSocketTransport {
                sink: Mutex::new(sink),
                pump,
            }),
            inbound: inbound_rx,
        })
    }
}

struct WebSocketTransport {
    sink: Mutex<WsSink>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        self.pump.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
