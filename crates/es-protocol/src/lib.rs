//! es-protocol: Message envelope for the EasyShell agent link
//!
//! This crate defines the JSON messages exchanged between the control
//! server and the host agent over the duplex WebSocket connection.

pub mod error;
pub mod job;
pub mod message;
pub mod session;

pub use error::ProtocolError;
pub use job::JobStatus;
pub use message::{
    decode_inbound, ExecuteRequest, InboundMessage, JobResult, LogLine, OutboundMessage,
    TerminalData, TerminalInput, TerminalRef, TerminalResize,
};
pub use session::{SessionKey, TerminalSize};
