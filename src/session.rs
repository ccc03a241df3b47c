//! Session: the single owner of the adapter transport.
//!
//! All reads and writes go through one `tokio::sync::Mutex` around the transport, so two
//! writes can never interleave on the wire. On top of that, a flow that needs the port
//! for a multi-step exchange (the test sequencer) takes a [`SessionLease`]. While a
//! lease is held, ad hoc sends, `open` and `close` from other flows fail with
//! `SessionBusy`, and the receive pump leaves the port alone.
//!
//! Failures never escape as panics. Every error is turned into a status line, and I/O
//! failures force the session closed so it is never left half-open.

use crate::adapters::Transport;
use crate::config::{AdapterConfig, ConnectionConfig};
use crate::error::{AppResult, BridgeError};
use crate::protocol::{prologix, Command};
use crate::status::StatusSink;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status line reported when the port cannot be opened.
pub const DEVICE_NOT_AVAILABLE: &str = "Prologix: Device Not Available";

/// Status line reported when the port is closed.
pub const DISCONNECTED: &str = "Disconnected";

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port open.
    Closed,
    /// Port open and usable.
    Open,
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Shared handle to the adapter session.
///
/// Cheap to clone; all clones refer to the same transport, lease and sink.
#[derive(Clone)]
pub struct Session {
    transport: SharedTransport,
    connection: Arc<StdMutex<ConnectionConfig>>,
    adapter: AdapterConfig,
    sink: Arc<dyn StatusSink>,
    lease: Arc<StdMutex<Option<String>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection())
            .field("lease", &self.lease_owner())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a closed session over `transport`.
    pub fn new(
        transport: Box<dyn Transport>,
        connection: ConnectionConfig,
        adapter: AdapterConfig,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            connection: Arc::new(StdMutex::new(connection)),
            adapter,
            sink,
            lease: Arc::new(StdMutex::new(None)),
        }
    }

    fn lease_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_slot(&self) -> MutexGuard<'_, ConnectionConfig> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current connection configuration.
    pub fn connection(&self) -> ConnectionConfig {
        self.connection_slot().clone()
    }

    /// Select the port used by the next open or auto-reopen.
    pub fn set_port(&self, port_name: &str) {
        self.connection_slot().port_name = Some(port_name.to_string());
    }

    /// Adapter configuration this session was built with.
    pub fn adapter_config(&self) -> &AdapterConfig {
        &self.adapter
    }

    /// Emit one status line.
    pub fn report(&self, text: &str) {
        self.sink.on_status_text(text);
    }

    /// Current state of the transport.
    pub async fn state(&self) -> SessionState {
        if self.transport.lock().await.is_open() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Owner of the exclusive lease, if any.
    pub fn lease_owner(&self) -> Option<String> {
        self.lease_slot().clone()
    }

    /// Whether a lease is currently held.
    pub fn is_leased(&self) -> bool {
        self.lease_slot().is_some()
    }

    fn ensure_unleased(&self) -> AppResult<()> {
        match self.lease_slot().as_ref() {
            Some(owner) => Err(BridgeError::SessionBusy {
                owner: owner.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Take exclusive use of the session.
    ///
    /// Fails immediately with `SessionBusy` if another flow holds the lease. The lease
    /// is released when the returned guard is dropped.
    pub fn acquire(&self, owner: &str) -> AppResult<SessionLease> {
        let mut slot = self.lease_slot();
        if let Some(current) = slot.as_ref() {
            return Err(BridgeError::SessionBusy {
                owner: current.clone(),
            });
        }
        *slot = Some(owner.to_string());
        debug!(owner, "Session lease acquired");

        Ok(SessionLease {
            session: self.clone(),
            owner: owner.to_string(),
        })
    }

    /// Open the port and bring the adapter up.
    ///
    /// Applies the connection config, discards stale buffers, then sends the bring-up
    /// handshake. Any failure is reported as "Device Not Available" and leaves the
    /// session closed. Opening an open session does nothing.
    ///
    /// # Errors
    ///
    /// `SessionBusy` if leased, otherwise `PortUnavailable`/`NotConnected` on failure.
    pub async fn open(&self) -> AppResult<()> {
        let config = self.connection();
        let mut transport = self.transport.lock().await;
        self.ensure_unleased()?;
        if transport.is_open() {
            debug!("Open requested on an open session");
            return Ok(());
        }

        if let Err(err) = self.bring_transport_up(&mut transport, &config).await {
            self.report(DEVICE_NOT_AVAILABLE);
            // Best effort; the transport may be half-configured.
            let _ = transport.close().await;
            warn!(port = ?config.port_name, "Open failed: {}", err);
            return Err(err);
        }

        info!(port = ?config.port_name, "Port open, sending adapter bring-up");
        for command in prologix::bring_up(self.adapter.gpib_address, config.timeout()) {
            if let Err(err) = self.dispatch(&mut transport, &command).await {
                self.report(DEVICE_NOT_AVAILABLE);
                return Err(match err {
                    BridgeError::PortUnavailable(_) | BridgeError::NotConnected => err,
                    other => BridgeError::PortUnavailable(other.to_string()),
                });
            }
        }
        Ok(())
    }

    async fn bring_transport_up(
        &self,
        transport: &mut Box<dyn Transport>,
        config: &ConnectionConfig,
    ) -> AppResult<()> {
        config.validate()?;
        transport.open(config).await?;
        transport.discard_buffers().await?;
        Ok(())
    }

    /// Close the port, reporting "Disconnected".
    ///
    /// Closing a closed session is a silent no-op.
    ///
    /// # Errors
    ///
    /// `SessionBusy` while a lease is held; `IoFailure` if the OS close fails (the
    /// session is still considered closed).
    pub async fn close(&self) -> AppResult<()> {
        let mut transport = self.transport.lock().await;
        self.ensure_unleased()?;
        if !transport.is_open() {
            return Ok(());
        }
        self.report(DISCONNECTED);
        transport.close().await.map_err(|err| {
            self.report(&err.to_string());
            err
        })
    }

    /// Send a raw command typed by the caller.
    ///
    /// Commands starting with `+` go to the adapter unescaped; everything else is
    /// escaped for the instrument. The command is echoed as `"> " + raw` before it is
    /// written, and the port is reopened first if it is closed.
    ///
    /// # Errors
    ///
    /// `EmptyCommand`, `SessionBusy`, or the failure that closed the session.
    pub async fn send(&self, raw: &str) -> AppResult<()> {
        let command = Command::parse(raw)?;
        self.send_command(&command).await
    }

    /// Send an already classified command through the echoing path.
    ///
    /// # Errors
    ///
    /// `SessionBusy`, or the failure that closed the session.
    pub async fn send_command(&self, command: &Command) -> AppResult<()> {
        let mut transport = self.transport.lock().await;
        self.ensure_unleased()?;
        self.dispatch(&mut transport, command).await
    }

    /// Echo, ensure open, write. Caller holds the transport lock.
    async fn dispatch(&self, transport: &mut Box<dyn Transport>, command: &Command) -> AppResult<()> {
        self.report(&command.echo());
        self.ensure_open(transport).await?;
        let frame = self.frame_for(command);
        self.write_frame(transport, &frame).await
    }

    /// Frame `command` with the link's line encoding.
    fn frame_for(&self, command: &Command) -> Vec<u8> {
        command.frame_with(self.connection_slot().encoding)
    }

    /// Reopen the transport with the current config if it is closed.
    ///
    /// This mirrors "ensure open then write": no handshake is repeated.
    async fn ensure_open(&self, transport: &mut Box<dyn Transport>) -> AppResult<()> {
        if transport.is_open() {
            return Ok(());
        }
        let config = self.connection();
        debug!(port = ?config.port_name, "Reopening closed port");
        if let Err(err) = config.validate().map_err(BridgeError::from) {
            self.report(&err.to_string());
            return Err(err);
        }
        transport.open(&config).await.map_err(|err| {
            self.report(DEVICE_NOT_AVAILABLE);
            warn!(port = ?config.port_name, "Reopen failed: {}", err);
            err
        })
    }

    /// Write one frame with the configured timeout; on failure close the session.
    ///
    /// A timed-out write may still be running inside the transport; its `close` waits for
    /// that call before the OS port is released.
    async fn write_frame(&self, transport: &mut Box<dyn Transport>, frame: &[u8]) -> AppResult<()> {
        if !transport.is_open() {
            let err = BridgeError::IoFailure("The port is closed.".to_string());
            return Err(self.fail(transport, err).await);
        }
        let timeout = self.connection().timeout();
        match tokio::time::timeout(timeout, transport.write(frame)).await {
            Ok(Ok(())) => {
                debug!(bytes = frame.len(), "Frame written");
                Ok(())
            }
            Ok(Err(err)) => Err(self.fail(transport, err).await),
            Err(_) => Err(self.fail(transport, BridgeError::Timeout(timeout)).await),
        }
    }

    /// Read everything buffered with the configured timeout; on failure close the session.
    async fn read_buffered(&self, transport: &mut Box<dyn Transport>) -> AppResult<String> {
        let config = self.connection();
        let timeout = config.timeout();
        match tokio::time::timeout(timeout, transport.read_available()).await {
            Ok(Ok(bytes)) => Ok(config.decode(&bytes)),
            Ok(Err(err)) => Err(self.fail(transport, err).await),
            Err(_) => Err(self.fail(transport, BridgeError::Timeout(timeout)).await),
        }
    }

    /// Report `err`, force the transport closed, and hand the error back.
    async fn fail(&self, transport: &mut Box<dyn Transport>, err: BridgeError) -> BridgeError {
        warn!("Transport failure, forcing session closed: {}", err);
        self.report(&err.to_string());
        if transport.is_open() {
            self.report(DISCONNECTED);
        }
        if let Err(close_err) = transport.close().await {
            warn!("Close after failure also failed: {}", close_err);
        }
        err
    }

    /// Forward any buffered input to the status sink, verbatim.
    ///
    /// Does nothing while the session is leased, closed, or busy with another
    /// exchange. Returns the number of characters forwarded.
    ///
    /// # Errors
    ///
    /// The read failure that closed the session.
    pub async fn pump_received(&self) -> AppResult<usize> {
        if self.is_leased() {
            return Ok(0);
        }
        let Ok(mut transport) = self.transport.try_lock() else {
            return Ok(0);
        };
        if self.is_leased() || !transport.is_open() {
            return Ok(0);
        }
        let text = self.read_buffered(&mut transport).await?;
        if !text.is_empty() {
            debug!(chars = text.len(), "Received data");
            self.report(&text);
        }
        Ok(text.len())
    }

    /// Poll for received data until `cancel` fires.
    pub fn spawn_receiver(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let session = self.clone();
        let interval = self.adapter.receive_poll();
        tokio::spawn(async move {
            debug!(?interval, "Receive pump started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = session.pump_received().await {
                            debug!("Receive pump read failed: {}", err);
                        }
                    }
                }
            }
            debug!("Receive pump stopped");
        })
    }
}

/// Exclusive use of a [`Session`], released on drop.
#[derive(Debug)]
pub struct SessionLease {
    session: Session,
    owner: String,
}

impl SessionLease {
    /// Name the lease was taken under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The leased session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Reopen the port (without handshake) if it is closed.
    ///
    /// # Errors
    ///
    /// The open failure, already reported to the sink.
    pub async fn ensure_open(&self) -> AppResult<()> {
        let mut transport = self.session.transport.lock().await;
        self.session.ensure_open(&mut transport).await
    }

    /// Send through the echoing, auto-reopening path.
    ///
    /// # Errors
    ///
    /// The failure that closed the session.
    pub async fn send(&self, command: &Command) -> AppResult<()> {
        let mut transport = self.session.transport.lock().await;
        self.session.dispatch(&mut transport, command).await
    }

    /// Write a command's frame directly: no echo and no reopen.
    ///
    /// # Errors
    ///
    /// The failure that closed the session (including a closed port).
    pub async fn write(&self, command: &Command) -> AppResult<()> {
        let mut transport = self.session.transport.lock().await;
        let frame = self.session.frame_for(command);
        self.session.write_frame(&mut transport, &frame).await
    }

    /// Drop pending input and output.
    ///
    /// # Errors
    ///
    /// The failure that closed the session.
    pub async fn discard_buffers(&self) -> AppResult<()> {
        let mut transport = self.session.transport.lock().await;
        if let Err(err) = transport.discard_buffers().await {
            return Err(self.session.fail(&mut transport, err).await);
        }
        Ok(())
    }

    /// Read whatever is buffered right now, decoded as text.
    ///
    /// # Errors
    ///
    /// The failure that closed the session.
    pub async fn read_available(&self) -> AppResult<String> {
        let mut transport = self.session.transport.lock().await;
        self.session.read_buffered(&mut transport).await
    }

    /// Wait `duration` while keeping the lease.
    pub async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut slot = self.session.lease_slot();
        if slot.as_deref() == Some(self.owner.as_str()) {
            debug!(owner = %self.owner, "Session lease released");
            *slot = None;
        }
    }
}
