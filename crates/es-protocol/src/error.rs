//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding an inbound frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Frame has no string `type` discriminator
    #[error("Message has no type discriminator")]
    MissingType,

    /// Discriminator names a type this agent does not handle
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known type, but the payload does not match its shape
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    /// Required identifier is present but empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Outbound encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
