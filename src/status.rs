//! Status sink: the append-only trace of what the bridge did.
//!
//! Echoed commands, text received from the adapter, sequence progress and error
//! messages all end up here as [`StatusLine`]s. The bridge emits from whatever task it
//! happens to run on; [`ChannelSink`] hands each line over to the context that owns
//! the display, and [`deliver_status`] applies them there in order.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Receives human-readable status text.
///
/// Implementations must be callable from any task or thread.
pub trait StatusSink: Send + Sync {
    /// Append one status line.
    fn on_status_text(&self, text: &str);
}

/// One immutable status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    timestamp: DateTime<Utc>,
    text: String,
}

impl StatusLine {
    /// Stamp `text` with the current time.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }

    /// When the line was emitted.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The text as emitted.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Sink that forwards lines to another context over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusLine>,
}

impl ChannelSink {
    /// Create the sink and the receiver the owning context drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn on_status_text(&self, text: &str) {
        if self.tx.send(StatusLine::new(text)).is_err() {
            tracing::debug!(text, "Status receiver dropped, discarding line");
        }
    }
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<StatusLine>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<StatusLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all lines so far.
    pub fn lines(&self) -> Vec<StatusLine> {
        self.guard().clone()
    }

    /// Snapshot of the text of all lines so far.
    pub fn texts(&self) -> Vec<String> {
        self.guard().iter().map(|l| l.text.clone()).collect()
    }

    /// Number of lines equal to `text`.
    pub fn count(&self, text: &str) -> usize {
        self.guard().iter().filter(|l| l.text == text).count()
    }
}

impl StatusSink for MemorySink {
    fn on_status_text(&self, text: &str) {
        self.guard().push(StatusLine::new(text));
    }
}

/// Drain `rx` on the calling context, applying each line in arrival order.
///
/// Every line is deferred by `settle` (or a single scheduler yield when zero) before
/// `apply` runs. Returns once all senders are gone.
pub async fn deliver_status<F>(mut rx: mpsc::UnboundedReceiver<StatusLine>, settle: Duration, mut apply: F)
where
    F: FnMut(&StatusLine),
{
    while let Some(line) = rx.recv().await {
        if settle.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(settle).await;
        }
        apply(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemorySink::new();
        sink.on_status_text("> ++ver");
        sink.on_status_text("Prologix GPIB-USB Controller version 6.0\r\n");
        sink.on_status_text("Disconnected");
        assert_eq!(
            sink.texts(),
            vec![
                "> ++ver".to_string(),
                "Prologix GPIB-USB Controller version 6.0\r\n".to_string(),
                "Disconnected".to_string()
            ]
        );
        assert_eq!(sink.count("Disconnected"), 1);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let sink = MemorySink::new();
        sink.on_status_text("a");
        sink.on_status_text("b");
        let lines = sink.lines();
        assert!(lines[0].timestamp() <= lines[1].timestamp());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_across_tasks() {
        let (sink, rx) = ChannelSink::new();

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                sink.on_status_text(&format!("line {}", i));
            }
        });
        producer.await.unwrap();

        let mut seen = Vec::new();
        deliver_status(rx, Duration::ZERO, |line| seen.push(line.text().to_string())).await;
        assert_eq!(seen, (0..5).map(|i| format!("line {}", i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_status_text("nobody listening");
    }
}
