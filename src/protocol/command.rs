//! Command classification and framing.
//!
//! A command whose first character is `+` is addressed to the adapter itself and goes
//! out verbatim. Anything else is for the instrument and is escaped first. Both kinds
//! end with CRLF.

use super::escape::escape_bytes;
use crate::config::LineEncoding;
use crate::error::{AppResult, BridgeError};
use std::fmt;

/// Prefix of adapter-directed commands.
pub const CONTROLLER_PREFIX: &str = "++";

/// Line terminator appended to every frame.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Who a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Adapter-directed (`++...`), sent unescaped.
    Controller,
    /// Instrument-directed, escaped before sending.
    Instrument,
}

/// A classified command, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    raw: String,
    kind: CommandKind,
}

impl Command {
    /// Classify a raw command by its first character.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCommand` for an empty string.
    pub fn parse(raw: impl Into<String>) -> AppResult<Self> {
        let raw = raw.into();
        let kind = match raw.chars().next() {
            None => return Err(BridgeError::EmptyCommand),
            Some('+') => CommandKind::Controller,
            Some(_) => CommandKind::Instrument,
        };
        Ok(Self { raw, kind })
    }

    /// Build an adapter command, adding the `++` prefix if missing.
    pub fn controller(body: &str) -> Self {
        let raw = if body.starts_with(CONTROLLER_PREFIX) {
            body.to_string()
        } else {
            format!("{}{}", CONTROLLER_PREFIX, body)
        };
        Self {
            raw,
            kind: CommandKind::Controller,
        }
    }

    /// Build an instrument command without classification.
    ///
    /// The text is always escaped, even if it happens to start with `+`.
    pub fn instrument(text: impl Into<String>) -> Self {
        Self {
            raw: text.into(),
            kind: CommandKind::Instrument,
        }
    }

    /// The command as typed, unescaped.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The classification.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// True for adapter-directed commands.
    pub fn is_controller(&self) -> bool {
        self.kind == CommandKind::Controller
    }

    /// The bytes written to the transport for this command, ASCII-encoded.
    pub fn frame(&self) -> Vec<u8> {
        self.frame_with(LineEncoding::Ascii)
    }

    /// The bytes written to the transport when the link uses `encoding`.
    pub fn frame_with(&self, encoding: LineEncoding) -> Vec<u8> {
        let encoded = encoding.encode(&self.raw);
        let mut frame = match self.kind {
            CommandKind::Controller => encoded,
            CommandKind::Instrument => escape_bytes(&encoded),
        };
        frame.extend_from_slice(LINE_TERMINATOR);
        frame
    }

    /// The status line echoed before transmission.
    pub fn echo(&self) -> String {
        format!("> {}", self.raw)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
