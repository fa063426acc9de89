//! Direct-stream capture: forward the child's stdout/stderr pipes as bytes
//! arrive.
//!
//! Delivery ends at EOF on both pipes, or [`EXIT_DRAIN_WINDOW`] after the
//! process exits, whichever comes first. Background processes started by
//! the agent inherit its pipes and may keep them open long after it exits.

use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::capture::{CaptureEvent, CaptureMode, OutputCapture, PreparedCapture};
use crate::{AppError, Result};

/// How long pipes are still read after the process has exited.
pub const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Pipe-based [`OutputCapture`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeCapture;

impl OutputCapture for PipeCapture {
    fn mode(&self) -> CaptureMode {
        CaptureMode::Pipe
    }

    fn prepare(&self, cmd: &mut Command) -> Result<Box<dyn PreparedCapture>> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        Ok(Box::new(PreparedPipes))
    }
}

struct PreparedPipes;

impl PreparedCapture for PreparedPipes {
    fn start(
        self: Box<Self>,
        child: &mut Child,
        mut exited: watch::Receiver<bool>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<JoinHandle<()>> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

        Ok(tokio::spawn(async move {
            let pipes = async move {
                tokio::join!(
                    forward(stdout, tx.clone(), CaptureEvent::Stdout),
                    forward(stderr, tx, CaptureEvent::Stderr),
                );
            };
            // A dropped sender means the supervisor is gone too.
            let exit = async move {
                let _ = exited.wait_for(|done| *done).await;
            };
            tokio::pin!(pipes);

            tokio::select! {
                () = &mut pipes => return,
                () = exit => {}
            }

            if tokio::time::timeout(EXIT_DRAIN_WINDOW, &mut pipes).await.is_err() {
                debug!("pipe capture: pipes still open after exit, closing");
            }
        }))
    }
}

async fn forward<R>(
    reader: R,
    tx: mpsc::Sender<CaptureEvent>,
    wrap: fn(bytes::Bytes) -> CaptureEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut stream = ReaderStream::new(reader);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(wrap(bytes)).await.is_err() {
                    debug!("pipe capture: receiver closed, stopping");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "pipe capture: read failed, stopping");
                return;
            }
        }
    }
}
