//! Mock transport for testing
//!
//! Stands in for the Prologix adapter without any hardware. It provides:
//! - Frame capture for wire-level assertions
//! - Scripted replies triggered by specific frames (e.g. `++read`)
//! - Controllable failure injection on open, on the n-th write and on the next read
//! - Simulated write latency for timeout tests
//!
//! Clones share state, so a test can keep one handle while the session owns another.

use super::Transport;
use crate::config::ConnectionConfig;
use crate::error::{AppResult, BridgeError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    open_count: usize,
    last_config: Option<ConnectionConfig>,
    fail_open: bool,
    fail_write_at: Option<usize>,
    fail_next_read: bool,
    write_count: usize,
    write_latency: Duration,
    frames: Vec<Vec<u8>>,
    input: VecDeque<u8>,
    replies: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    call_log: Vec<String>,
}

/// Scriptable in-memory transport
///
/// # Example
///
/// ```
/// use gpib_bridge::adapters::MockTransport;
///
/// let mock = MockTransport::new();
/// mock.reply_on(b"++read\r\n", "0.0025\r\n");
/// assert!(!mock.is_port_open());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a closed mock with no scripted behaviour.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every write by `latency`.
    pub fn with_write_latency(self, latency: Duration) -> Self {
        self.state().write_latency = latency;
        self
    }

    /// Make every subsequent open fail (until cleared).
    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Fail the write with this zero-based index, counted over the mock's lifetime.
    pub fn fail_write_at(&self, index: usize) {
        self.state().fail_write_at = Some(index);
    }

    /// Fail the next read with an I/O error.
    pub fn fail_next_read(&self) {
        self.state().fail_next_read = true;
    }

    /// Queue `reply` to appear on the input side when exactly `frame` is written.
    ///
    /// Multiple replies for the same frame are consumed in order.
    pub fn reply_on(&self, frame: &[u8], reply: &str) {
        self.state()
            .replies
            .entry(frame.to_vec())
            .or_default()
            .push_back(reply.as_bytes().to_vec());
    }

    /// Make bytes available for reading as if the adapter had sent them.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state().input.extend(bytes.iter().copied());
    }

    /// Every frame written so far, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().frames.clone()
    }

    /// Written frames rendered lossily as text, for readable assertions.
    pub fn frames_as_text(&self) -> Vec<String> {
        self.state()
            .frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Whether the mock port is open.
    pub fn is_port_open(&self) -> bool {
        self.state().open
    }

    /// How many times the port was opened successfully.
    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    /// Configuration passed to the most recent open.
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.state().last_config.clone()
    }

    /// Sequence of operations performed, e.g. `["open", "discard", "write", "close"]`.
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, config: &ConnectionConfig) -> AppResult<()> {
        let mut state = self.state();
        state.call_log.push("open".to_string());
        let port_name = config.port_name.clone().ok_or(BridgeError::NotConnected)?;
        if state.fail_open {
            return Err(BridgeError::PortUnavailable(format!(
                "Access to the port '{}' is denied.",
                port_name
            )));
        }
        state.open = true;
        state.open_count += 1;
        state.last_config = Some(config.clone());
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.state();
        state.call_log.push("close".to_string());
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn write(&mut self, frame: &[u8]) -> AppResult<()> {
        let latency = self.state().write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.call_log.push("write".to_string());
        if !state.open {
            return Err(BridgeError::IoFailure("The port is closed.".to_string()));
        }

        let index = state.write_count;
        state.write_count += 1;
        if state.fail_write_at == Some(index) {
            state.fail_write_at = None;
            return Err(BridgeError::IoFailure(
                "The I/O operation has been aborted because of either a thread exit or an application request.".to_string(),
            ));
        }

        state.frames.push(frame.to_vec());
        let reply = state.replies.get_mut(frame).and_then(VecDeque::pop_front);
        if let Some(reply) = reply {
            state.input.extend(reply);
        }
        Ok(())
    }

    async fn read_available(&mut self) -> AppResult<Vec<u8>> {
        let mut state = self.state();
        state.call_log.push("read".to_string());
        if !state.open {
            return Err(BridgeError::IoFailure("The port is closed.".to_string()));
        }
        if std::mem::take(&mut state.fail_next_read) {
            return Err(BridgeError::IoFailure(
                "A device attached to the system is not functioning.".to_string(),
            ));
        }
        Ok(state.input.drain(..).collect())
    }

    async fn discard_buffers(&mut self) -> AppResult<()> {
        let mut state = self.state();
        state.call_log.push("discard".to_string());
        if !state.open {
            return Err(BridgeError::IoFailure("The port is closed.".to_string()));
        }
        state.input.clear();
        Ok(())
    }
}
