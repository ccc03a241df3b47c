//! Serial transport for the Prologix USB-GPIB adapter
//!
//! Wraps the serialport crate and provides async I/O using Tokio's blocking task
//! executor for the synchronous serial operations.

use super::Transport;
use crate::config::ConnectionConfig;
#[cfg(feature = "instrument_serial")]
use crate::config::{Handshake, Parity};
use crate::error::{AppResult, BridgeError};
use async_trait::async_trait;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;
use tracing::warn;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

#[cfg(not(feature = "instrument_serial"))]
const FEATURE_DISABLED: &str = "Serial support not enabled. Rebuild with --features instrument_serial";

/// Names of the serial ports the OS reports, in enumeration order.
///
/// Enumeration failures are logged and yield an empty list.
pub fn list_ports() -> Vec<String> {
    #[cfg(feature = "instrument_serial")]
    {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        warn!("{}", FEATURE_DISABLED);
        Vec::new()
    }
}

/// Serial transport for RS-232/USB-serial links
#[derive(Default)]
pub struct SerialTransport {
    /// Port name of the current (or last) connection
    port_name: Option<String>,

    /// Read/write timeout applied at open
    timeout: Duration,

    /// The actual serial port (behind Arc<Mutex> for the blocking executor)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a closed transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Port name of the current or last connection.
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    #[cfg(feature = "instrument_serial")]
    fn handle(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| BridgeError::IoFailure("The port is closed.".to_string()))
    }
}

/// Drop the last handle to `shared`, waiting up to `wait` for blocking calls that
/// still hold clones of it.
///
/// A timed-out `spawn_blocking` call keeps running with its own clone, so the OS port
/// is only released once that call returns. Returns false if it was still held when
/// `wait` ran out; the value is then dropped by whichever holder finishes last.
#[cfg(feature = "instrument_serial")]
async fn release_shared<T>(shared: Arc<Mutex<T>>, wait: Duration) -> bool {
    let mut shared = shared;
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match Arc::try_unwrap(shared) {
            Ok(inner) => {
                drop(inner);
                return true;
            }
            Err(still_shared) => {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                shared = still_shared;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn map_io(err: std::io::Error, timeout: Duration) -> BridgeError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        BridgeError::Timeout(timeout)
    } else {
        BridgeError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "instrument_serial")]
fn open_port(config: &ConnectionConfig, port_name: &str) -> Result<Box<dyn SerialPort>, serialport::Error> {
    let data_bits = match config.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };
    let flow_control = match config.handshake {
        Handshake::None => serialport::FlowControl::None,
        Handshake::XonXoff => serialport::FlowControl::Software,
        Handshake::RequestToSend => serialport::FlowControl::Hardware,
    };

    let mut port = serialport::new(port_name, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(config.timeout())
        .open()?;

    port.write_request_to_send(config.rts_enable)?;
    port.write_data_terminal_ready(config.dtr_enable)?;
    Ok(port)
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, config: &ConnectionConfig) -> AppResult<()> {
        let port_name = config.port_name.clone().ok_or(BridgeError::NotConnected)?;
        self.port_name = Some(port_name.clone());
        self.timeout = config.timeout();

        #[cfg(feature = "instrument_serial")]
        {
            if config.parity_replace != 0 {
                debug!(
                    port = %port_name,
                    "parity_replace is not supported by the serialport backend; ignoring"
                );
            }

            let open_config = config.clone();
            let name = port_name.clone();
            let port = tokio::task::spawn_blocking(move || open_port(&open_config, &name))
                .await
                .map_err(|e| BridgeError::PortUnavailable(format!("Serial open task panicked: {}", e)))?
                .map_err(|e| {
                    BridgeError::PortUnavailable(format!("Failed to open serial port {}: {}", port_name, e))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %port_name, baud = config.baud_rate, "Serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(BridgeError::PortUnavailable(format!("{}: {}", port_name, FEATURE_DISABLED)))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if let Some(port) = self.port.take() {
                // The serial driver bounds every blocking call by the port timeout.
                if release_shared(port, self.timeout * 2).await {
                    debug!(port = ?self.port_name, "Serial port closed");
                } else {
                    warn!(
                        port = ?self.port_name,
                        "Serial port still busy at close; released when the pending call returns"
                    );
                }
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn write(&mut self, frame: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            let frame = frame.to_vec();
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port = port.blocking_lock();
                port.write_all(&frame).map_err(|e| map_io(e, timeout))?;
                port.flush().map_err(|e| map_io(e, timeout))?;
                debug!(bytes = frame.len(), "Wrote frame to serial port");
                Ok(())
            })
            .await
            .map_err(|e| BridgeError::IoFailure(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = frame;
            Err(BridgeError::IoFailure(FEATURE_DISABLED.to_string()))
        }
    }

    async fn read_available(&mut self) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
                use std::io::Read;

                let mut port = port.blocking_lock();
                let pending = port
                    .bytes_to_read()
                    .map_err(|e| BridgeError::IoFailure(e.to_string()))? as usize;
                if pending == 0 {
                    return Ok(Vec::new());
                }

                let mut buf = vec![0u8; pending];
                let mut filled = 0;
                while filled < pending {
                    match port.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(e) => return Err(map_io(e, timeout)),
                    }
                }
                buf.truncate(filled);
                Ok(buf)
            })
            .await
            .map_err(|e| BridgeError::IoFailure(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(BridgeError::IoFailure(FEATURE_DISABLED.to_string()))
        }
    }

    async fn discard_buffers(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            tokio::task::spawn_blocking(move || {
                port.blocking_lock()
                    .clear(serialport::ClearBuffer::All)
                    .map_err(|e| BridgeError::IoFailure(e.to_string()))
            })
            .await
            .map_err(|e| BridgeError::IoFailure(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(BridgeError::IoFailure(FEATURE_DISABLED.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_starts_closed() {
        let transport = SerialTransport::new();
        assert!(!transport.is_open());
        assert!(transport.port_name().is_none());
    }

    #[tokio::test]
    async fn test_open_without_port_name() {
        let mut transport = SerialTransport::new();
        let result = transport.open(&ConnectionConfig::default()).await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_missing_device_is_unavailable() {
        let mut transport = SerialTransport::new();
        let config = ConnectionConfig::default().with_port("/dev/gpib-bridge-does-not-exist");
        let result = transport.open(&config).await;
        assert!(matches!(result, Err(BridgeError::PortUnavailable(_))));
        assert!(!transport.is_open());
        assert_eq!(transport.port_name(), Some("/dev/gpib-bridge-does-not-exist"));
    }

    #[tokio::test]
    async fn test_io_on_closed_port_fails() {
        let mut transport = SerialTransport::new();
        assert!(transport.write(b"++ver\r\n").await.is_err());
        assert!(transport.read_available().await.is_err());
        assert!(transport.close().await.is_ok());
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_waits_for_blocking_holder() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Handle(Arc<AtomicBool>);
        impl Drop for Handle {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Mutex::new(Handle(dropped.clone())));
        let held = Arc::clone(&shared);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let blocking = tokio::task::spawn_blocking(move || {
            let _guard = held.blocking_lock();
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(50));
        });
        started_rx.await.unwrap();

        assert!(release_shared(shared, Duration::from_secs(2)).await);
        assert!(dropped.load(Ordering::SeqCst));
        blocking.await.unwrap();
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn test_release_gives_up_after_wait() {
        let shared = Arc::new(Mutex::new(0u8));
        let _other = Arc::clone(&shared);
        assert!(!release_shared(shared, Duration::from_millis(10)).await);
    }
}
