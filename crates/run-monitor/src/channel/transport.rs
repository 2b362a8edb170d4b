use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use run_protocol::hub;

use crate::error::{MonitorError, Result};

/// Opens transports to the push-event service. The channel calls it again
/// for every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, token: Option<&str>) -> Result<Box<dyn Transport>>;
}

/// One established connection that already completed the hub handshake.
#[async_trait]
pub trait Transport: Send {
    /// Sends one encoded hub record.
    async fn send(&mut self, record: String) -> Result<()>;

    /// Next text frame, `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: Option<&str>) -> Result<Box<dyn Transport>> {
        let url = url_with_token(url, token);
        let (stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                MonitorError::Transport(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(MonitorError::transport)?;
        let mut transport = WsTransport {
            stream,
            pending: VecDeque::new(),
        };
        let handshake = hub::encode_handshake().map_err(MonitorError::transport)?;
        transport.send(handshake).await?;
        let frame = timeout(self.connect_timeout, transport.recv())
            .await
            .map_err(|_| MonitorError::Transport("handshake timed out".to_string()))?
            .ok_or_else(|| MonitorError::Transport("closed during handshake".to_string()))??;
        let mut records = hub::split_records(&frame);
        let response = records
            .next()
            .ok_or_else(|| MonitorError::Transport("empty handshake response".to_string()))
            .and_then(|record| hub::parse_handshake(record).map_err(MonitorError::transport))?;
        if let Some(error) = response.error {
            transport.close().await;
            return Err(MonitorError::Transport(format!("handshake rejected: {error}")));
        }
        transport.pending.extend(records.map(str::to_string));
        debug!(pending = transport.pending.len(), "hub handshake completed");
        Ok(Box::new(transport))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<String>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, record: String) -> Result<()> {
        self.stream
            .send(Message::Text(record))
            .await
            .map_err(MonitorError::transport)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if let Some(record) = self.pending.pop_front() {
            return Some(Ok(record));
        }
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(MonitorError::transport))
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(err) => return Some(Err(MonitorError::transport(err))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// The hub authenticates WebSocket upgrades through the `access_token`
/// query parameter.
pub(crate) fn url_with_token(url: &str, token: Option<&str>) -> String {
    match token.filter(|token| !token.is_empty()) {
        Some(token) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}access_token={}", urlencoding::encode(token))
        }
        None => url.to_string(),
    }
}
