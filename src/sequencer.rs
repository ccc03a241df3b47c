//! Delay-generator test sequence.
//!
//! Takes an exclusive lease on the session, switches the adapter to explicit reads
//! (`++auto 0`), then for each step programs a delay, queries it back, forces a
//! `++read`, waits for the slow instrument and collects whatever arrived. Auto-read
//! is switched back on afterwards even if a step failed, and a `Completed` event is
//! always the last thing emitted so the caller can re-enable its controls.

use crate::config::SequenceConfig;
use crate::error::{AppResult, BridgeError};
use crate::protocol::{prologix, Command};
use crate::session::{Session, SessionLease};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease owner name used by the sequencer.
pub const SEQUENCER_OWNER: &str = "test-sequence";

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Zero-based step index.
    pub step: usize,
    /// Delay programmed in this step, in seconds.
    pub delay: f64,
    /// Raw text read back after `++read`.
    pub response: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSummary {
    /// Steps that produced a progress event.
    pub steps_completed: usize,
    /// Steps that were planned.
    pub steps_planned: usize,
    /// Failure that aborted the run, if any.
    pub error: Option<String>,
    /// Whether the run stopped because it was cancelled.
    pub cancelled: bool,
}

impl SequenceSummary {
    /// True when every planned step ran.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.cancelled && self.steps_completed == self.steps_planned
    }
}

/// Events streamed while a sequence runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// One step finished.
    Progress(ProgressEvent),
    /// The run is over; always the final event.
    Completed(SequenceSummary),
}

/// A spawned run: the event stream plus the task handle.
#[derive(Debug)]
pub struct SequenceRun {
    /// Progress events followed by exactly one `Completed`.
    pub events: mpsc::UnboundedReceiver<SequenceEvent>,
    /// Resolves to the number of completed steps.
    pub task: JoinHandle<AppResult<usize>>,
    /// Cancels the run at the next step boundary.
    pub cancel: CancellationToken,
}

/// Delay programmed at `step`: even steps use `even_delay`, odd steps `odd_delay`.
pub fn delay_for_step(config: &SequenceConfig, step: usize) -> f64 {
    if step % 2 == 0 {
        config.even_delay
    } else {
        config.odd_delay
    }
}

/// Render a delay the way the instrument panel prints numbers.
///
/// Shortest round-trip digits, in plain decimal for decimal exponents from -4 up to
/// 14 and as `d.dE-XX` outside that range: `1.5e-5` is `1.5E-05`, `2.5e-3` is `0.0025`.
pub fn format_delay(delay: f64) -> String {
    let scientific = format!("{:e}", delay);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = match exponent.parse() {
        Ok(exponent) => exponent,
        Err(_) => return scientific,
    };
    if delay == 0.0 || (-4..15).contains(&exponent) {
        format!("{}", delay)
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}E{}{:02}", mantissa, sign, exponent.abs())
    }
}

/// Scripted write/read test against the delay generator.
#[derive(Debug, Clone)]
pub struct Sequencer {
    session: Session,
    config: SequenceConfig,
}

impl Sequencer {
    /// Create a sequencer over `session`.
    pub fn new(session: Session, config: SequenceConfig) -> Self {
        Self { session, config }
    }

    /// Parameters of this sequencer.
    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    /// `DT <channel>,<reference>,<delay>`
    pub fn set_delay_command(&self, delay: f64) -> Command {
        Command::instrument(format!(
            "DT {},{},{}",
            self.config.delay_channel,
            self.config.reference_channel,
            format_delay(delay)
        ))
    }

    /// `DT <channel>`
    pub fn query_delay_command(&self) -> Command {
        Command::instrument(format!("DT {}", self.config.delay_channel))
    }

    /// Lease the session now and run in the background.
    ///
    /// The lease is taken before this returns, so other flows are refused from the
    /// moment the run exists. The stream yields one `Progress` per step and then
    /// `Completed`.
    ///
    /// # Errors
    ///
    /// `SessionBusy` if another flow holds the lease; nothing is spawned.
    pub fn start(self, cancel: CancellationToken) -> AppResult<SequenceRun> {
        let lease = self.lease()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run_leased(lease, tx, token).await });
        Ok(SequenceRun {
            events: rx,
            task,
            cancel,
        })
    }

    /// Run the sequence to completion on the current task.
    ///
    /// Progress is sent on `events` (and echoed to the status sink) in step order,
    /// followed by one `Completed` event no matter how the run ended.
    ///
    /// # Errors
    ///
    /// `SessionBusy` if the lease is taken, `Cancelled`, or the I/O failure that
    /// aborted the remaining steps.
    pub async fn run(
        &self,
        events: mpsc::UnboundedSender<SequenceEvent>,
        cancel: CancellationToken,
    ) -> AppResult<usize> {
        match self.lease() {
            Ok(lease) => self.run_leased(lease, events, cancel).await,
            Err(err) => {
                let result: AppResult<()> = Err(err);
                self.finish(&events, 0, &result);
                result.map(|_| 0)
            }
        }
    }

    fn lease(&self) -> AppResult<SessionLease> {
        self.session.acquire(SEQUENCER_OWNER).map_err(|err| {
            warn!("Test sequence could not lease the session: {}", err);
            self.session.report(&err.to_string());
            err
        })
    }

    async fn run_leased(
        &self,
        lease: SessionLease,
        events: mpsc::UnboundedSender<SequenceEvent>,
        cancel: CancellationToken,
    ) -> AppResult<usize> {
        info!(steps = self.config.steps, "Test sequence started");
        let mut completed = 0;
        let result = match lease.ensure_open().await {
            Ok(()) => {
                let result = self.run_steps(&lease, &events, &cancel, &mut completed).await;
                self.restore_auto_read(&lease).await;
                result
            }
            // Never opened, so auto-read was never switched off.
            Err(err) => Err(err),
        };
        drop(lease);

        self.finish(&events, completed, &result);
        result.map(|_| completed)
    }

    fn finish(
        &self,
        events: &mpsc::UnboundedSender<SequenceEvent>,
        completed: usize,
        result: &AppResult<()>,
    ) {
        let summary = SequenceSummary {
            steps_completed: completed,
            steps_planned: self.config.steps,
            error: match result {
                Err(err) if !matches!(err, BridgeError::Cancelled) => Some(err.to_string()),
                _ => None,
            },
            cancelled: matches!(result, Err(BridgeError::Cancelled)),
        };
        info!(?summary, "Test sequence finished");
        let _ = events.send(SequenceEvent::Completed(summary));
    }

    async fn run_steps(
        &self,
        lease: &SessionLease,
        events: &mpsc::UnboundedSender<SequenceEvent>,
        cancel: &CancellationToken,
        completed: &mut usize,
    ) -> AppResult<()> {
        lease.write(&Command::controller(prologix::AUTO_OFF)).await?;

        let read = Command::controller(prologix::READ);
        let query = self.query_delay_command();

        for step in 0..self.config.steps {
            if cancel.is_cancelled() {
                info!(step, "Test sequence cancelled");
                return Err(BridgeError::Cancelled);
            }

            lease.discard_buffers().await?;

            let delay = delay_for_step(&self.config, step);
            lease.write(&self.set_delay_command(delay)).await?;
            lease.write(&query).await?;
            lease.write(&read).await?;

            lease.settle(self.config.settle()).await;

            let response = lease.read_available().await?;
            debug!(step, delay, response = %response.trim_end(), "Sequence step done");
            if !response.is_empty() {
                self.session.report(&response);
            }
            let _ = events.send(SequenceEvent::Progress(ProgressEvent {
                step,
                delay,
                response,
            }));
            *completed += 1;
        }
        Ok(())
    }

    /// Put the adapter back into read-after-write mode, whatever happened before.
    async fn restore_auto_read(&self, lease: &SessionLease) {
        let restore = async {
            lease.ensure_open().await?;
            lease.write(&Command::controller(prologix::AUTO_ON)).await
        };
        if let Err(err) = restore.await {
            warn!("Could not re-enable auto read after the sequence: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_alternation() {
        let config = SequenceConfig::default();
        let delays: Vec<f64> = (0..10).map(|i| delay_for_step(&config, i)).collect();
        for (i, delay) in delays.iter().enumerate() {
            let expected = if i % 2 == 0 { 1.5e-5 } else { 2.5e-3 };
            assert_eq!(*delay, expected, "step {}", i);
        }
    }

    #[test]
    fn test_summary_completeness() {
        let summary = SequenceSummary {
            steps_completed: 10,
            steps_planned: 10,
            error: None,
            cancelled: false,
        };
        assert!(summary.is_complete());
        let aborted = SequenceSummary {
            error: Some("I/O failure".into()),
            steps_completed: 3,
            ..summary
        };
        assert!(!aborted.is_complete());
    }

    #[test]
    fn test_format_delay_matches_panel_notation() {
        assert_eq!(format_delay(1.5e-5), "1.5E-05");
        assert_eq!(format_delay(2.5e-3), "0.0025");
        assert_eq!(format_delay(1e-4), "0.0001");
        assert_eq!(format_delay(1e-5), "1E-05");
        assert_eq!(format_delay(0.0), "0");
        assert_eq!(format_delay(12.5), "12.5");
        assert_eq!(format_delay(1e15), "1E+15");
        assert_eq!(format_delay(3.25e-12), "3.25E-12");
    }

    #[test]
    fn test_set_delay_command_text() {
        use crate::adapters::MockTransport;
        use crate::config::{AdapterConfig, ConnectionConfig};
        use crate::status::MemorySink;
        use std::sync::Arc;

        let session = Session::new(
            Box::new(MockTransport::new()),
            ConnectionConfig::default(),
            AdapterConfig::default(),
            Arc::new(MemorySink::new()),
        );
        let sequencer = Sequencer::new(session, SequenceConfig::default());
        assert_eq!(sequencer.set_delay_command(1.5e-5).raw(), "DT 2,1,1.5E-05");
        assert_eq!(sequencer.set_delay_command(2.5e-3).raw(), "DT 2,1,0.0025");
    }
}
