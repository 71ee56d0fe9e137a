//! Duplex connection manager
//!
//! Keeps one WebSocket connection to the control server open for the life
//! of the process. A lost connection tears down every terminal session,
//! waits, and dials again; running jobs are not touched and keep
//! reporting through the plain request path in the meantime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use es_core::{AgentId, ConnectionError};
use es_protocol::OutboundMessage;

use super::dispatch::Dispatcher;
use super::outbound::{Outbound, PushChannel};
use crate::exec::JobExecutor;
use crate::pty::{SessionMultiplexer, TerminalOutput};

/// Pause between a lost connection and the next dial
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ping period on an open connection
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest keepalive period accepted
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal output chunks buffered ahead of the socket; PTY readers block
/// while it is full.
const TERMINAL_OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of the duplex connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Shutdown requested; no further dials
    Terminated,
}

/// Build `{ws|wss}://host[:port]/ws/agent/{agent_id}` from the control
/// server's HTTP base address.
pub fn agent_ws_url(server_url: &str, agent_id: &AgentId) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws/agent/{}", base, agent_id)
}

/// Owns the reconnect loop
pub struct ConnectionManager {
    url: String,
    outbound: Arc<Outbound>,
    sessions: Arc<SessionMultiplexer>,
    executor: Arc<JobExecutor>,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        server_url: &str,
        agent_id: &AgentId,
        outbound: Arc<Outbound>,
        sessions: Arc<SessionMultiplexer>,
        executor: Arc<JobExecutor>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: agent_ws_url(server_url, agent_id),
            outbound,
            sessions,
            executor,
            reconnect_delay: RECONNECT_DELAY,
            keepalive_interval: KEEPALIVE_INTERVAL,
            state,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Clamped to [`MIN_KEEPALIVE_INTERVAL`]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(MIN_KEEPALIVE_INTERVAL);
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Address dialed on every attempt
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Dial, serve, and redial until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(url = %self.url, "connection manager starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_and_serve(&shutdown).await {
                Ok(()) => tracing::debug!("connection ended by shutdown"),
                Err(e) => tracing::warn!(error = %e, "websocket connection lost"),
            }

            self.teardown().await;
            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    tracing::info!("reconnecting in background");
                }
            }
        }

        self.teardown().await;
        self.set_state(ConnectionState::Terminated);
        tracing::info!("connection manager stopped");
    }

    /// One connection from dial to loss. `Ok` only when shutdown ended it.
    async fn connect_and_serve(&self, shutdown: &CancellationToken) -> Result<(), ConnectionError> {
        tracing::info!("Connecting to {}", self.url);

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = connect_async(self.url.as_str()) => result,
        };
        let (ws, _response) = connected.map_err(|e| ConnectionError::Dial {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        let (sink, mut stream) = ws.split();
        self.outbound.attach(sink).await;
        self.set_state(ConnectionState::Connected);
        tracing::info!("websocket connected");

        // Scoped to this connection; cancelled on every return path.
        let connection = shutdown.child_token();
        let _stop_tasks = connection.clone().drop_guard();

        let (output_tx, output_rx) = mpsc::channel(TERMINAL_OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(pump_terminal_output(
            Arc::clone(&self.outbound),
            output_rx,
            connection.clone(),
        ));
        tokio::spawn(keepalive(
            Arc::clone(&self.outbound),
            self.keepalive_interval,
            connection.clone(),
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.sessions),
            self.outbound.clone() as Arc<dyn PushChannel>,
            output_tx,
        );

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => dispatcher.dispatch(&text).await,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => dispatcher.dispatch(&text).await,
                    Err(_) => tracing::warn!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Pong(_))) => tracing::trace!("pong received"),
                Some(Ok(Message::Ping(_))) => tracing::trace!("ping received"),
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    return Err(ConnectionError::Closed(reason));
                }
                Some(Err(e)) => return Err(ConnectionError::Read(e.to_string())),
                None => return Err(ConnectionError::Closed("stream ended".to_string())),
            }
        }
    }

    /// Release everything bound to the lost connection
    async fn teardown(&self) {
        self.outbound.detach().await;
        let closed = self.sessions.close_all();
        if closed > 0 {
            tracing::info!(closed, "terminal sessions closed with connection");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "connection state");
            *current = state;
            true
        });
    }
}

/// Forward terminal output to the socket until the connection ends
async fn pump_terminal_output(
    outbound: Arc<Outbound>,
    mut output: mpsc::Receiver<TerminalOutput>,
    connection: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = connection.cancelled() => break,
            chunk = output.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let message = OutboundMessage::terminal_output(chunk.key, chunk.data);
        if let Err(e) = outbound.push(&message).await {
            tracing::debug!(error = %e, "dropping terminal output");
        }
    }
}

/// Ping every `period`; stops on the first failed send
async fn keepalive(outbound: Arc<Outbound>, period: Duration, connection: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = connection.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = outbound.send_ping().await {
                    tracing::warn!(error = %e, "keepalive ping failed");
                    break;
                }
                tracing::trace!("keepalive ping sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_ws_url() {
        let id = AgentId::from("ag_web01");
        assert_eq!(
            agent_ws_url("http://control:8080", &id),
            "ws://control:8080/ws/agent/ag_web01"
        );
        assert_eq!(
            agent_ws_url("https://control.example.com/", &id),
            "wss://control.example.com/ws/agent/ag_web01"
        );
        assert_eq!(
            agent_ws_url("ws://127.0.0.1:9000", &id),
            "ws://127.0.0.1:9000/ws/agent/ag_web01"
        );
    }
}
