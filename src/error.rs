//! Custom error types for the bridge.
//!
//! `BridgeError` is the single error type returned by the library. Every failure the
//! protocol bridge can run into falls into one of a handful of kinds:
//!
//! - **`PortUnavailable`**: the serial port could not be opened or configured. Reported
//!   to the status sink as "Device Not Available" and never fatal.
//! - **`IoFailure`**: a read or write on an open port failed. The session is forced
//!   closed and the underlying message is surfaced.
//! - **`Timeout`**: a read or write exceeded the configured bound. Treated as a kind of
//!   I/O failure (see [`BridgeError::is_io_failure`]).
//! - **`SessionBusy`**: another flow (usually the test sequencer) holds the exclusive
//!   lease on the session.
//! - **`Config`**: configuration could not be loaded or failed validation.
//!
//! All of these are caught at the session boundary and converted into status lines;
//! none of them should terminate the process.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type AppResult<T> = std::result::Result<T, BridgeError>;

/// Errors raised by the GPIB bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The port could not be opened.
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// A read or write on an open port failed.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// A read or write did not complete within the configured bound.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A session is already open on the named port.
    #[error("Port {0} is already open")]
    AlreadyOpen(String),

    /// No port has been selected, so the session cannot be (re)opened.
    #[error("Serial port not connected")]
    NotConnected,

    /// The session is leased exclusively by another flow.
    #[error("Session is busy (leased by '{owner}')")]
    SessionBusy {
        /// Name of the current lease holder.
        owner: String,
    },

    /// An empty command string was submitted.
    #[error("Command is empty")]
    EmptyCommand,

    /// A running operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// True for `IoFailure` and `Timeout`, the kinds that force a session closed.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, BridgeError::IoFailure(_) | BridgeError::Timeout(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::IoFailure(err.to_string())
    }
}
