//! Outbound writer task.
//!
//! Receives [`OutboundMessage`]s from a tokio [`mpsc`] channel, serialises
//! each to compact JSON, and sends it as one text frame on the WebSocket
//! sink. The task exits when:
//!
//! - `cancel` is triggered: queued messages are flushed, then a close frame
//!   with the normal-closure code is sent;
//! - `msg_rx` is closed (all senders dropped): same close handshake;
//! - a send fails.

use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::outbound::OutboundMessage;
use crate::{AppError, Result};

/// Reason text sent with the closing frame.
pub const CLOSE_REASON: &str = "agent relay shutting down";

/// Writer task for one connection.
///
/// # Errors
///
/// - [`AppError::Protocol`] if a message cannot be serialised.
/// - [`AppError::Connection`] if the sink rejects a frame.
pub async fn run_writer<S>(
    mut sink: S,
    mut msg_rx: mpsc::Receiver<OutboundMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, flushing queue");
                while let Ok(message) = msg_rx.try_recv() {
                    send_message(&mut sink, &message).await?;
                }
                break;
            }

            msg = msg_rx.recv() => match msg {
                None => {
                    debug!("writer: message channel closed");
                    break;
                }
                Some(message) => send_message(&mut sink, &message).await?,
            },
        }
    }

    close(&mut sink).await
}

async fn send_message<S>(sink: &mut S, message: &OutboundMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(message).map_err(|e| {
        AppError::Protocol(format!("failed to serialise outbound message: {e}"))
    })?;

    sink.send(Message::Text(text)).await.map_err(|e| {
        warn!(kind = message.kind(), error = %e, "writer: send failed");
        AppError::Connection(format!("send failed: {e}"))
    })
}

async fn close<S>(sink: &mut S) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: CLOSE_REASON.into(),
    };
    sink.send(Message::Close(Some(frame)))
        .await
        .map_err(|e| AppError::Connection(format!("close failed: {e}")))?;
    sink.close()
        .await
        .map_err(|e| AppError::Connection(format!("close failed: {e}")))
}
