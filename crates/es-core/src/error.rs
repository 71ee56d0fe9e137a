//! Core error types for the EasyShell agent

use es_protocol::{ProtocolError, SessionKey};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Control plane error
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Duplex connection errors. All of these are recoverable by reconnecting.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Handshake with the control server failed
    #[error("Dial {url} failed: {reason}")]
    Dial { url: String, reason: String },

    /// Reading a frame failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Writing a frame failed
    #[error("Send failed: {0}")]
    Send(String),

    /// No connection is currently attached
    #[error("No connection")]
    NotConnected,

    /// Peer closed the connection
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Outbound message could not be encoded
    #[error("Encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Terminal session errors, reported per session as `terminal_error`
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session with this key
    #[error("session not found: {0}")]
    NotFound(SessionKey),

    /// Session was already torn down
    #[error("session closed: {0}")]
    Closed(SessionKey),

    /// Pseudo-terminal or shell could not be started
    #[error("start pty: {0}")]
    Spawn(String),

    /// Pseudo-terminal resize failed
    #[error("resize pty: {0}")]
    Resize(String),

    /// Pseudo-terminal I/O failed
    #[error("pty I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Plain request/response control plane errors
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Request never got an HTTP response
    #[error("{method} {path}: {reason}")]
    Transport {
        method: &'static str,
        path: String,
        reason: String,
    },

    /// Non-2xx HTTP status
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    /// Server wrapper carried a non-200 code
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response body was not the expected shape
    #[error("Decode response: {0}")]
    Decode(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
