//! Prologix wire protocol
//!
//! Everything needed to turn a command string into the bytes written to the adapter:
//! - [`escape`] - byte-stuffing for instrument-directed commands
//! - [`command`] - controller/instrument classification and CRLF framing
//! - [`prologix`] - `++` controller commands and the bring-up handshake

pub mod command;
pub mod escape;
pub mod prologix;

pub use command::{Command, CommandKind, CONTROLLER_PREFIX, LINE_TERMINATOR};
pub use escape::escape;
