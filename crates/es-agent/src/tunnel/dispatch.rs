//! Inbound message routing
//!
//! Decodes each text frame and hands it to the job executor or the
//! terminal multiplexer. Nothing here waits on a job or on terminal
//! output, so the read loop is never stalled by work it dispatched.

use std::sync::Arc;

use tokio::sync::mpsc;

use es_core::SessionError;
use es_protocol::{
    decode_inbound, ExecuteRequest, InboundMessage, OutboundMessage, ProtocolError, SessionKey,
    TerminalInput, TerminalResize,
};

use super::outbound::PushChannel;
use crate::exec::JobExecutor;
use crate::pty::{SessionMultiplexer, TerminalOutput};

/// Routes inbound messages for one connection
pub struct Dispatcher {
    executor: Arc<JobExecutor>,
    sessions: Arc<SessionMultiplexer>,
    push: Arc<dyn PushChannel>,
    terminal_output: mpsc::Sender<TerminalOutput>,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<JobExecutor>,
        sessions: Arc<SessionMultiplexer>,
        push: Arc<dyn PushChannel>,
        terminal_output: mpsc::Sender<TerminalOutput>,
    ) -> Self {
        Self {
            executor,
            sessions,
            push,
            terminal_output,
        }
    }

    /// Handle one text frame. Undecodable frames are logged and dropped.
    pub async fn dispatch(&self, text: &str) {
        let message = match decode_inbound(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                tracing::warn!(kind = %kind, "ignoring unknown message type");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                return;
            }
        };

        tracing::debug!(kind = message.kind(), "received message");

        match message {
            InboundMessage::Execute(req) => self.execute(req),
            InboundMessage::TerminalOpen(m) => self.terminal_open(m.session_id).await,
            InboundMessage::TerminalInput(m) => self.terminal_input(m).await,
            InboundMessage::TerminalResize(m) => self.terminal_resize(m).await,
            InboundMessage::TerminalClose(m) => {
                self.sessions.close(&m.session_id);
            }
        }
    }

    fn execute(&self, req: ExecuteRequest) {
        tracing::info!(job_id = %req.job_id, task_id = %req.task_id, "job received");
        // Detached; the job reports its own result.
        drop(self.executor.spawn(req));
    }

    async fn terminal_open(&self, key: SessionKey) {
        let reply = match self.sessions.open(key.clone(), self.terminal_output.clone()) {
            Ok(_) => OutboundMessage::terminal_ready(key),
            Err(e) => {
                tracing::warn!(session = %key, error = %e, "failed to open terminal");
                OutboundMessage::terminal_error(key, e.to_string())
            }
        };
        self.reply(reply).await;
    }

    async fn terminal_input(&self, input: TerminalInput) {
        if let Err(e) = self.sessions.write(&input.session_id, input.data.as_bytes()) {
            self.report_error(input.session_id, e).await;
        }
    }

    async fn terminal_resize(&self, resize: TerminalResize) {
        if let Err(e) = self.sessions.resize(&resize.session_id, resize.size()) {
            self.report_error(resize.session_id, e).await;
        }
    }

    async fn report_error(&self, key: SessionKey, error: SessionError) {
        tracing::debug!(session = %key, error = %error, "terminal operation failed");
        self.reply(OutboundMessage::terminal_error(key, error.to_string()))
            .await;
    }

    async fn reply(&self, message: OutboundMessage) {
        if let Err(e) = self.push.push(&message).await {
            tracing::warn!(kind = message.kind(), error = %e, "failed to send reply");
        }
    }
}
