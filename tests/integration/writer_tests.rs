//! Integration tests for the outbound writer task.

use std::convert::Infallible;

use futures_util::sink;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use agent_relay::models::outbound::OutboundMessage;
use agent_relay::relay::writer::run_writer;

/// A sink that forwards every frame to an unbounded channel.
fn recording_sink(
    frames: mpsc::UnboundedSender<Message>,
) -> std::pin::Pin<Box<impl futures_util::Sink<Message, Error = Infallible>>> {
    Box::pin(sink::unfold(
        frames,
        |frames: mpsc::UnboundedSender<Message>, frame: Message| async move {
            let _ = frames.send(frame);
            Ok::<_, Infallible>(frames)
        },
    ))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Queued messages are flushed before the normal-closure frame on cancel.
#[tokio::test]
async fn cancel_flushes_queue_then_closes_normally() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::channel(8);
    msg_tx
        .send(OutboundMessage::error("r1", "first"))
        .await
        .expect("queue");
    msg_tx
        .send(OutboundMessage::error("r2", "second"))
        .await
        .expect("queue");

    let cancel = CancellationToken::new();
    cancel.cancel();
    run_writer(recording_sink(frames_tx), msg_rx, cancel)
        .await
        .expect("writer");

    let frames = drain(&mut frames_rx);
    assert_eq!(frames.len(), 3);
    for (frame, request_id) in frames.iter().zip(["r1", "r2"]) {
        let Message::Text(text) = frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let value: serde_json::Value = serde_json::from_str(text).expect("json frame");
        assert_eq!(value["type"], "error");
        assert_eq!(value["request_id"], request_id);
    }
    match &frames[2] {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// Dropping every sender also ends the writer with a close frame.
#[tokio::test]
async fn closed_channel_ends_writer() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::channel(8);
    let writer = tokio::spawn(run_writer(
        recording_sink(frames_tx),
        msg_rx,
        CancellationToken::new(),
    ));

    msg_tx
        .send(OutboundMessage::error("r1", "only"))
        .await
        .expect("queue");
    drop(msg_tx);
    writer.await.expect("join").expect("writer");

    let frames = drain(&mut frames_rx);
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], Message::Text(_)));
    assert!(matches!(frames[1], Message::Close(Some(_))));
}
