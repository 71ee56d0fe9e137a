//! Interactive terminal sessions on pseudo-terminals

mod manager;
mod session;

pub use manager::SessionMultiplexer;
pub use session::{ShellSpec, TerminalOutput, TerminalSession};
