//! Transport adapters
//!
//! The session talks to the Prologix adapter through the [`Transport`] trait, an
//! open/close-able byte stream. Two implementations live here:
//! - [`SerialTransport`] - a real serial port via the `serialport` crate
//! - [`MockTransport`] - scriptable in-memory stand-in for tests and dry runs

use crate::config::ConnectionConfig;
use crate::error::AppResult;
use async_trait::async_trait;

pub mod mock_adapter;
pub mod serial_adapter;

pub use mock_adapter::MockTransport;
pub use serial_adapter::{list_ports, SerialTransport};

/// Byte stream to the adapter.
///
/// Callers serialise access; implementations need not be reentrant. Timeouts are
/// enforced by the caller as well as by the implementation where the OS supports it.
#[async_trait]
pub trait Transport: Send {
    /// Apply `config` and open the port.
    async fn open(&mut self, config: &ConnectionConfig) -> AppResult<()>;

    /// Close the port and release OS resources. Closing a closed port is a no-op.
    async fn close(&mut self) -> AppResult<()>;

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Write the whole frame.
    async fn write(&mut self, frame: &[u8]) -> AppResult<()>;

    /// Read every byte currently buffered without waiting for more.
    async fn read_available(&mut self) -> AppResult<Vec<u8>>;

    /// Drop any pending input and output.
    async fn discard_buffers(&mut self) -> AppResult<()>;
}
