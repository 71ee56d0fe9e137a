//! Outbound half of the duplex connection
//!
//! Every producer (job log lines, job results, terminal output, terminal
//! replies, keepalive pings) writes through one [`Outbound`], which
//! serializes writers with an async mutex. A send never interleaves with
//! another and only the connection manager attaches or detaches the sink.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use es_core::ConnectionError;
use es_protocol::OutboundMessage;

/// WebSocket stream as returned by `connect_async`
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of [`WsStream`]
pub type WsSink = SplitSink<WsStream, Message>;

/// Best-effort push over the duplex connection.
///
/// `Err` means the message was not handed to the transport; the caller
/// decides whether a fallback path applies.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn push(&self, message: &OutboundMessage) -> Result<(), ConnectionError>;
}

/// Shared, lock-protected handle to the current connection's write half
#[derive(Default)]
pub struct Outbound {
    sink: Mutex<Option<WsSink>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the write half of a freshly established connection
    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Drop the current connection, sending a close frame if possible
    pub(crate) async fn detach(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "closing websocket sink failed");
            }
        }
    }

    /// Whether a connection is currently attached
    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Send a protocol-level ping
    pub async fn send_ping(&self) -> Result<(), ConnectionError> {
        self.send_frame(Message::Ping(Vec::new())).await
    }

    async fn send_frame(&self, frame: Message) -> Result<(), ConnectionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        sink.send(frame)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }
}

#[async_trait]
impl PushChannel for Outbound {
    async fn push(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
        let text = message.to_json()?;
        self.send_frame(Message::Text(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es_protocol::SessionKey;

    #[tokio::test]
    async fn test_push_without_connection() {
        let outbound = Outbound::new();
        assert!(!outbound.is_connected().await);

        let err = outbound
            .push(&OutboundMessage::terminal_ready(SessionKey::from("s1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));

        let err = outbound.send_ping().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_detach_without_connection_is_noop() {
        let outbound = Outbound::new();
        outbound.detach().await;
        assert!(!outbound.is_connected().await);
    }
}
