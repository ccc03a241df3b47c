//! Test sequence behaviour against a scripted mock adapter.

use gpib_bridge::adapters::MockTransport;
use gpib_bridge::config::AdapterConfig;
use gpib_bridge::sequencer::SEQUENCER_OWNER;
use gpib_bridge::session::{DEVICE_NOT_AVAILABLE, DISCONNECTED};
use gpib_bridge::{
    BridgeError, ConnectionConfig, MemorySink, SequenceConfig, SequenceEvent, Sequencer, Session,
    SessionState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bring-up frames written by a plain open.
const BRING_UP_FRAMES: usize = 7;

/// Instrument framing: NUL after every byte, then CRLF.
fn padded(text: &str) -> Vec<u8> {
    let mut frame: Vec<u8> = text.bytes().flat_map(|b| [b, 0x00]).collect();
    frame.extend_from_slice(b"\r\n");
    frame
}

fn fast_sequence() -> SequenceConfig {
    SequenceConfig {
        settle_ms: 5,
        ..SequenceConfig::default()
    }
}

async fn open_session(mock: &MockTransport) -> (Session, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(
        Box::new(mock.clone()),
        ConnectionConfig::default().with_port("MOCK0"),
        AdapterConfig::default(),
        sink.clone(),
    );
    session.open().await.expect("mock open should succeed");
    (session, sink)
}

fn drain(mut rx: mpsc::UnboundedReceiver<SequenceEvent>) -> Vec<SequenceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_full_run_emits_ten_ordered_steps() {
    let mock = MockTransport::new();
    for _ in 0..10 {
        mock.reply_on(b"++read\r\n", "response\r\n");
    }
    let (session, sink) = open_session(&mock).await;
    let sequencer = Sequencer::new(session.clone(), fast_sequence());

    let (tx, rx) = mpsc::unbounded_channel();
    let completed = sequencer
        .run(tx, CancellationToken::new())
        .await
        .expect("sequence should complete");
    assert_eq!(completed, 10);

    let events = drain(rx);
    assert_eq!(events.len(), 11);
    for (i, event) in events[..10].iter().enumerate() {
        match event {
            SequenceEvent::Progress(progress) => {
                assert_eq!(progress.step, i);
                let expected = if i % 2 == 0 { 1.5e-5 } else { 2.5e-3 };
                assert_eq!(progress.delay, expected);
                assert_eq!(progress.response, "response\r\n");
            }
            other => panic!("expected progress at {}, got {:?}", i, other),
        }
    }
    match &events[10] {
        SequenceEvent::Completed(summary) => assert!(summary.is_complete()),
        other => panic!("expected completion, got {:?}", other),
    }

    assert_eq!(sink.count("response\r\n"), 10);
    assert!(!session.is_leased());
}

#[tokio::test]
async fn test_wire_order_brackets_steps_with_auto_read() {
    let mock = MockTransport::new();
    let (session, sink) = open_session(&mock).await;
    let sequencer = Sequencer::new(session, fast_sequence());

    let (tx, _rx) = mpsc::unbounded_channel();
    sequencer.run(tx, CancellationToken::new()).await.unwrap();

    let frames = mock.frames();
    let run = &frames[BRING_UP_FRAMES..];
    assert_eq!(run.len(), 1 + 10 * 3 + 1);
    assert_eq!(run[0], b"++auto 0\r\n".to_vec());
    assert_eq!(run[1], padded("DT 2,1,1.5E-05"));
    assert_eq!(run[2], padded("DT 2"));
    assert_eq!(run[3], b"++read\r\n".to_vec());
    assert_eq!(run[4], padded("DT 2,1,0.0025"));
    assert_eq!(run.last().unwrap(), &b"++auto 1\r\n".to_vec());

    // Direct writes: nothing but the bring-up was echoed.
    let echoes = sink.texts().iter().filter(|t| t.starts_with("> ")).count();
    assert_eq!(echoes, BRING_UP_FRAMES);
}

#[tokio::test]
async fn test_write_failure_still_restores_auto_read() {
    let mock = MockTransport::new();
    let (session, sink) = open_session(&mock).await;
    // auto 0, then three writes per step: index 14 is the third step's set command.
    mock.fail_write_at(BRING_UP_FRAMES + 1 + 2 * 3);
    let sequencer = Sequencer::new(session.clone(), fast_sequence());

    let (tx, rx) = mpsc::unbounded_channel();
    let result = sequencer.run(tx, CancellationToken::new()).await;
    assert!(matches!(result, Err(BridgeError::IoFailure(_))));

    let events = drain(rx);
    let progress = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::Progress(_)))
        .count();
    assert_eq!(progress, 2);
    match events.last() {
        Some(SequenceEvent::Completed(summary)) => {
            assert_eq!(summary.steps_completed, 2);
            assert!(summary.error.is_some());
            assert!(!summary.cancelled);
        }
        other => panic!("expected completion last, got {:?}", other),
    }

    // The failure closed the port; restoring auto-read reopened it.
    assert_eq!(mock.open_count(), 2);
    assert_eq!(mock.frames_as_text().last().unwrap(), "++auto 1\r\n");
    assert_eq!(session.state().await, SessionState::Open);
    assert_eq!(sink.count(DISCONNECTED), 1);
    assert!(!session.is_leased());
}

#[tokio::test]
async fn test_cancelled_before_first_step() {
    let mock = MockTransport::new();
    let (session, _sink) = open_session(&mock).await;
    let sequencer = Sequencer::new(session, fast_sequence());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, rx) = mpsc::unbounded_channel();
    let result = sequencer.run(tx, cancel).await;
    assert!(matches!(result, Err(BridgeError::Cancelled)));

    match drain(rx).as_slice() {
        [SequenceEvent::Completed(summary)] => {
            assert!(summary.cancelled);
            assert_eq!(summary.steps_completed, 0);
            assert!(summary.error.is_none());
        }
        other => panic!("expected a single completion, got {:?}", other),
    }
    let frames = mock.frames_as_text();
    assert_eq!(frames[BRING_UP_FRAMES..], ["++auto 0\r\n", "++auto 1\r\n"]);
}

#[tokio::test]
async fn test_second_run_rejected_while_leased() {
    let mock = MockTransport::new();
    let (session, sink) = open_session(&mock).await;
    let _lease = session.acquire(SEQUENCER_OWNER).unwrap();

    let sequencer = Sequencer::new(session, fast_sequence());
    let (tx, rx) = mpsc::unbounded_channel();
    let result = sequencer.run(tx, CancellationToken::new()).await;
    assert!(matches!(result, Err(BridgeError::SessionBusy { .. })));

    assert!(matches!(
        drain(rx).as_slice(),
        [SequenceEvent::Completed(summary)] if summary.error.is_some()
    ));
    assert!(sink.texts().last().unwrap().starts_with("Session is busy"));
    assert_eq!(mock.frames().len(), BRING_UP_FRAMES);
}

#[tokio::test]
async fn test_custom_step_count_and_channels() {
    let mock = MockTransport::new();
    let (session, _sink) = open_session(&mock).await;
    let config = SequenceConfig {
        steps: 3,
        delay_channel: 3,
        reference_channel: 2,
        ..fast_sequence()
    };
    let sequencer = Sequencer::new(session, config);
    assert_eq!(sequencer.query_delay_command().raw(), "DT 3");

    let (tx, rx) = mpsc::unbounded_channel();
    assert_eq!(sequencer.run(tx, CancellationToken::new()).await.unwrap(), 3);
    assert_eq!(drain(rx).len(), 4);
    assert_eq!(mock.frames()[BRING_UP_FRAMES + 1], padded("DT 3,2,1.5E-05"));
}

fn closed_session(mock: &MockTransport) -> (Session, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(
        Box::new(mock.clone()),
        ConnectionConfig::default().with_port("MOCK0"),
        AdapterConfig::default(),
        sink.clone(),
    );
    (session, sink)
}

#[tokio::test]
async fn test_closed_session_is_opened_first() {
    let mock = MockTransport::new();
    let (session, _sink) = closed_session(&mock);
    let sequencer = Sequencer::new(session.clone(), SequenceConfig {
        steps: 2,
        ..fast_sequence()
    });

    let (tx, rx) = mpsc::unbounded_channel();
    assert_eq!(sequencer.run(tx, CancellationToken::new()).await.unwrap(), 2);

    assert_eq!(mock.open_count(), 1);
    assert_eq!(session.state().await, SessionState::Open);
    // Reopened without the bring-up handshake.
    let frames = mock.frames_as_text();
    assert_eq!(frames.first().unwrap(), "++auto 0\r\n");
    assert_eq!(frames.last().unwrap(), "++auto 1\r\n");
    assert_eq!(frames.len(), 1 + 2 * 3 + 1);
    assert!(matches!(
        drain(rx).last(),
        Some(SequenceEvent::Completed(summary)) if summary.is_complete()
    ));
}

#[tokio::test]
async fn test_unavailable_port_reported_once() {
    let mock = MockTransport::new();
    mock.set_fail_open(true);
    let (session, sink) = closed_session(&mock);
    let sequencer = Sequencer::new(session.clone(), fast_sequence());

    let (tx, rx) = mpsc::unbounded_channel();
    let result = sequencer.run(tx, CancellationToken::new()).await;
    assert!(matches!(result, Err(BridgeError::PortUnavailable(_))));

    assert_eq!(sink.count(DEVICE_NOT_AVAILABLE), 1);
    assert!(mock.frames().is_empty());
    assert_eq!(mock.call_log(), vec!["open".to_string()]);
    match drain(rx).as_slice() {
        [SequenceEvent::Completed(summary)] => {
            assert_eq!(summary.steps_completed, 0);
            assert!(summary.error.is_some());
        }
        other => panic!("expected a single completion, got {:?}", other),
    }
    assert!(!session.is_leased());
}

#[tokio::test]
async fn test_silent_instrument_adds_no_status_lines() {
    let mock = MockTransport::new();
    let (session, sink) = open_session(&mock).await;
    let before = sink.texts().len();
    let sequencer = Sequencer::new(session, fast_sequence());

    let (tx, rx) = mpsc::unbounded_channel();
    sequencer.run(tx, CancellationToken::new()).await.unwrap();

    assert_eq!(sink.texts().len(), before);
    let responses: Vec<String> = drain(rx)
        .into_iter()
        .filter_map(|e| match e {
            SequenceEvent::Progress(p) => Some(p.response),
            SequenceEvent::Completed(_) => None,
        })
        .collect();
    assert_eq!(responses, vec![String::new(); 10]);
}
