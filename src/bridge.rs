//! Caller-facing operations.
//!
//! [`Bridge`] is what a UI or CLI drives: list ports, open/close a port, send raw
//! commands, run the test sequence, and shut down in order. It owns the session, the
//! receive pump and at most one sequencer run.

use crate::adapters::{self, Transport};
use crate::config::BridgeConfig;
use crate::error::{AppResult, BridgeError};
use crate::sequencer::{SequenceEvent, Sequencer, SEQUENCER_OWNER};
use crate::session::{Session, SessionState};
use crate::status::StatusSink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<AppResult<usize>>,
}

/// The instrument-control bridge.
pub struct Bridge {
    session: Session,
    config: BridgeConfig,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<()>>,
    run: Option<ActiveRun>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("session", &self.session)
            .field("receiver_running", &self.receiver.is_some())
            .field("sequence_running", &self.is_sequence_running())
            .finish()
    }
}

impl Bridge {
    /// Build a bridge over an arbitrary transport.
    pub fn new(transport: Box<dyn Transport>, config: BridgeConfig, sink: Arc<dyn StatusSink>) -> Self {
        let session = Session::new(
            transport,
            config.connection.clone(),
            config.adapter.clone(),
            sink,
        );
        Self {
            session,
            config,
            shutdown: CancellationToken::new(),
            receiver: None,
            run: None,
        }
    }

    /// Build a bridge over a real serial port.
    pub fn with_serial(config: BridgeConfig, sink: Arc<dyn StatusSink>) -> Self {
        Self::new(Box::new(adapters::SerialTransport::new()), config, sink)
    }

    /// Serial ports the OS currently reports.
    pub fn list_ports() -> Vec<String> {
        adapters::list_ports()
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Configuration the bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open `port_name` and bring the adapter up.
    ///
    /// Starts the receive pump on first success.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen` if a port is open, `SessionBusy` during a sequence, or the open
    /// failure (already reported as "Device Not Available").
    pub async fn open_port(&mut self, port_name: &str) -> AppResult<()> {
        if self.session.state().await == SessionState::Open {
            let current = self.session.connection().port_name.unwrap_or_default();
            return Err(BridgeError::AlreadyOpen(current));
        }
        if let Some(owner) = self.session.lease_owner() {
            return Err(BridgeError::SessionBusy { owner });
        }

        self.session.set_port(port_name);
        self.session.open().await?;
        info!(port = port_name, "Port opened");

        if self.receiver.is_none() {
            self.receiver = Some(self.session.spawn_receiver(self.shutdown.child_token()));
        }
        Ok(())
    }

    /// Close the port, reporting "Disconnected" once.
    ///
    /// # Errors
    ///
    /// `SessionBusy` while the test sequence runs.
    pub async fn close_port(&mut self) -> AppResult<()> {
        self.session.close().await
    }

    /// Send a raw command; `+`-prefixed commands go to the adapter, anything else to
    /// the instrument.
    ///
    /// # Errors
    ///
    /// `EmptyCommand`, `SessionBusy` during a sequence, or the I/O failure.
    pub async fn send_raw(&self, command: &str) -> AppResult<()> {
        self.session.send(command).await
    }

    /// Whether a sequence run is in flight.
    pub fn is_sequence_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.task.is_finished())
    }

    /// Start the test sequence in the background.
    ///
    /// The session lease is taken before this returns, so sends and close are refused
    /// from that point on. The returned stream yields one `Progress` per step followed
    /// by `Completed`.
    ///
    /// # Errors
    ///
    /// `SessionBusy` if a run is already in flight or another flow holds the lease.
    pub fn run_test_sequence(&mut self) -> AppResult<mpsc::UnboundedReceiver<SequenceEvent>> {
        if self.is_sequence_running() {
            return Err(BridgeError::SessionBusy {
                owner: SEQUENCER_OWNER.to_string(),
            });
        }

        let sequencer = Sequencer::new(self.session.clone(), self.config.sequence.clone());
        let run = sequencer.start(self.shutdown.child_token())?;
        self.run = Some(ActiveRun {
            cancel: run.cancel,
            task: run.task,
        });
        debug!("Test sequence spawned");
        Ok(run.events)
    }

    /// Ask a running sequence to stop at the next step boundary.
    pub fn cancel_sequence(&self) {
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }

    /// Wait for the current sequence run, if any, and return its outcome.
    ///
    /// # Errors
    ///
    /// The run's own error, or `IoFailure` if the task panicked.
    pub async fn wait_sequence(&mut self) -> AppResult<Option<usize>> {
        match self.run.take() {
            Some(run) => run
                .task
                .await
                .map_err(|e| BridgeError::IoFailure(format!("Sequence task failed: {}", e)))?
                .map(Some),
            None => Ok(None),
        }
    }

    /// Orderly shutdown.
    ///
    /// Cancels a running sequence and waits for it to release the session, stops the
    /// receive pump, then closes the port (reporting "Disconnected" if it was open).
    ///
    /// # Errors
    ///
    /// The close failure, if any.
    pub async fn shutdown(mut self) -> AppResult<()> {
        info!("Shutting down bridge");
        self.shutdown.cancel();

        match self.wait_sequence().await {
            Ok(_) | Err(BridgeError::Cancelled) => {}
            Err(err) => warn!("Sequence ended with an error during shutdown: {}", err),
        }

        if let Some(receiver) = self.receiver.take() {
            if let Err(err) = receiver.await {
                warn!("Receive pump did not stop cleanly: {}", err);
            }
        }

        self.session.close().await
    }
}
