//! Core library for the GPIB bridge.
//!
//! Lets a host drive a GPIB delay generator through a Prologix-style USB-to-GPIB
//! adapter that speaks a line-oriented ASCII protocol over a serial link:
//! - [`protocol`] - escaping, command classification and framing, `++` commands
//! - [`adapters`] - the transport abstraction, a serial implementation and a mock
//! - [`session`] - the single owner of the transport, bring-up and exchange
//! - [`sequencer`] - the scripted delay-generator test
//! - [`bridge`] - caller-facing operations
//!
//! # Features
//!
//! - `instrument_serial` (default) - real serial ports via the `serialport` crate
//!
//! # Example
//!
//! ```no_run
//! use gpib_bridge::{Bridge, BridgeConfig, MemorySink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sink = Arc::new(MemorySink::new());
//!     let mut bridge = Bridge::with_serial(BridgeConfig::load()?, sink.clone());
//!     bridge.open_port("/dev/ttyUSB0").await?;
//!     bridge.send_raw("DT 2").await?;
//!     bridge.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod status;

pub use bridge::Bridge;
pub use config::{BridgeConfig, ConfigError, ConnectionConfig, SequenceConfig};
pub use error::{AppResult, BridgeError};
pub use sequencer::{ProgressEvent, SequenceEvent, SequenceSummary, Sequencer};
pub use session::{Session, SessionLease, SessionState};
pub use status::{ChannelSink, MemorySink, StatusLine, StatusSink};
