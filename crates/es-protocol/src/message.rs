//! Message types for the EasyShell agent link
//!
//! Every WebSocket text frame carries exactly one JSON object whose `type`
//! field selects the payload shape. Payload fields are camelCase.
//!
//! # Message Flow
//!
//! 1. Agent dials `{ws|wss}://{host}/ws/agent/{agentId}`
//! 2. Server pushes `execute`; agent streams `log` lines and finishes with `result`
//! 3. Server pushes `terminal_open`; agent answers `terminal_ready` or `terminal_error`
//! 4. Terminal I/O: `terminal_input` / `terminal_resize` inbound, `terminal_output` outbound
//! 5. Session end: `terminal_close` from the server, or the shell exiting on its own

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::job::JobStatus;
use crate::session::{SessionKey, TerminalSize};

/// Discriminators accepted by [`decode_inbound`]
const INBOUND_TYPES: &[&str] = &[
    "execute",
    "terminal_open",
    "terminal_input",
    "terminal_resize",
    "terminal_close",
];

/// Request to run a shell script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub job_id: String,
    #[serde(default)]
    pub task_id: String,
    pub script: String,
    /// Seconds; zero or negative selects the agent default
    #[serde(default)]
    pub timeout: i64,
}

impl ExecuteRequest {
    /// The explicit timeout, if the server supplied a positive one
    pub fn timeout_secs(&self) -> Option<u64> {
        u64::try_from(self.timeout).ok().filter(|secs| *secs > 0)
    }
}

/// One streamed output line of a running job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub job_id: String,
    pub log: String,
}

/// Final outcome of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output: String,
}

/// Payload that only names a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRef {
    pub session_id: SessionKey,
}

/// Keystrokes for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInput {
    pub session_id: SessionKey,
    #[serde(default)]
    pub data: String,
}

/// New geometry for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResize {
    pub session_id: SessionKey,
    pub cols: u16,
    pub rows: u16,
}

impl TerminalResize {
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }
}

/// Session output, or an error description for `terminal_error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalData {
    pub session_id: SessionKey,
    pub data: String,
}

/// Messages pushed by the control server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Execute(ExecuteRequest),
    TerminalOpen(TerminalRef),
    TerminalInput(TerminalInput),
    TerminalResize(TerminalResize),
    TerminalClose(TerminalRef),
}

impl InboundMessage {
    /// Wire discriminator of this message
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Execute(_) => "execute",
            InboundMessage::TerminalOpen(_) => "terminal_open",
            InboundMessage::TerminalInput(_) => "terminal_input",
            InboundMessage::TerminalResize(_) => "terminal_resize",
            InboundMessage::TerminalClose(_) => "terminal_close",
        }
    }

    /// Session this message addresses, if it is a terminal message
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            InboundMessage::Execute(_) => None,
            InboundMessage::TerminalOpen(m) | InboundMessage::TerminalClose(m) => {
                Some(&m.session_id)
            }
            InboundMessage::TerminalInput(m) => Some(&m.session_id),
            InboundMessage::TerminalResize(m) => Some(&m.session_id),
        }
    }

    /// Encode as a single text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if let InboundMessage::Execute(req) = self {
            if req.job_id.is_empty() {
                return Err(ProtocolError::MissingField("jobId"));
            }
        }
        match self.session_key() {
            Some(key) if key.is_empty() => Err(ProtocolError::MissingField("sessionId")),
            _ => Ok(()),
        }
    }
}

/// Messages reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Log(LogLine),
    Result(JobResult),
    TerminalOutput(TerminalData),
    TerminalReady(TerminalRef),
    TerminalError(TerminalData),
}

impl OutboundMessage {
    pub fn log(job_id: impl Into<String>, line: impl Into<String>) -> Self {
        OutboundMessage::Log(LogLine {
            job_id: job_id.into(),
            log: line.into(),
        })
    }

    pub fn terminal_output(session_id: SessionKey, data: String) -> Self {
        OutboundMessage::TerminalOutput(TerminalData { session_id, data })
    }

    pub fn terminal_ready(session_id: SessionKey) -> Self {
        OutboundMessage::TerminalReady(TerminalRef { session_id })
    }

    pub fn terminal_error(session_id: SessionKey, message: impl Into<String>) -> Self {
        OutboundMessage::TerminalError(TerminalData {
            session_id,
            data: message.into(),
        })
    }

    /// Wire discriminator of this message
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Log(_) => "log",
            OutboundMessage::Result(_) => "result",
            OutboundMessage::TerminalOutput(_) => "terminal_output",
            OutboundMessage::TerminalReady(_) => "terminal_ready",
            OutboundMessage::TerminalError(_) => "terminal_error",
        }
    }

    /// Encode as a single text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one inbound text frame.
///
/// The discriminator is checked before the payload so that an unknown type
/// and a malformed known type surface as different errors.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    let message: InboundMessage =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })?;

    message.validate()?;
    Ok(message)
}
