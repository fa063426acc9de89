//! Sink-file capture: redirect stdout/stderr to files and poll them.
//!
//! Each poll stats a sink, reads only the bytes past the recorded offset,
//! and advances the offset by exactly the number of bytes read. Polling
//! stops once the process has exited and a final drain finds nothing new.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use super::capture::{CaptureEvent, CaptureMode, OutputCapture, PreparedCapture};
use super::watchdog::SilenceWatchdog;
use crate::{AppError, Result};

const STDOUT_SINK: &str = "stdout.log";
const STDERR_SINK: &str = "stderr.log";

/// File-polling [`OutputCapture`].
#[derive(Debug, Clone)]
pub struct SinkFileCapture {
    poll_interval: Duration,
    quiet_period: Duration,
}

impl SinkFileCapture {
    /// Create a strategy polling every `poll_interval`; an advisory fires
    /// after `quiet_period` of silence (zero disables it).
    #[must_use]
    pub fn new(poll_interval: Duration, quiet_period: Duration) -> Self {
        Self {
            poll_interval,
            quiet_period,
        }
    }
}

impl OutputCapture for SinkFileCapture {
    fn mode(&self) -> CaptureMode {
        CaptureMode::SinkFile
    }

    fn prepare(&self, cmd: &mut Command) -> Result<Box<dyn PreparedCapture>> {
        let dir = tempfile::Builder::new()
            .prefix("agent-relay-")
            .tempdir()
            .map_err(|err| AppError::Io(format!("failed to create sink dir: {err}")))?;

        let stdout_path = dir.path().join(STDOUT_SINK);
        let stderr_path = dir.path().join(STDERR_SINK);
        let stdout = create_sink(&stdout_path)?;
        let stderr = create_sink(&stderr_path)?;

        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        Ok(Box::new(PreparedSinks {
            dir,
            stdout: SinkCursor::new(stdout_path),
            stderr: SinkCursor::new(stderr_path),
            poll_interval: self.poll_interval,
            quiet_period: self.quiet_period,
        }))
    }
}

fn create_sink(path: &Path) -> Result<std::fs::File> {
    std::fs::File::create(path)
        .map_err(|err| AppError::Io(format!("failed to create {}: {err}", path.display())))
}

struct PreparedSinks {
    /// Deleted when the poll task ends.
    dir: TempDir,
    stdout: SinkCursor,
    stderr: SinkCursor,
    poll_interval: Duration,
    quiet_period: Duration,
}

impl PreparedCapture for PreparedSinks {
    fn start(
        self: Box<Self>,
        _child: &mut Child,
        exited: watch::Receiver<bool>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<JoinHandle<()>> {
        let span = info_span!("sink_capture", dir = %self.dir.path().display());
        Ok(tokio::spawn(self.run(exited, tx).instrument(span)))
    }
}

impl PreparedSinks {
    async fn run(mut self, exited: watch::Receiver<bool>, tx: mpsc::Sender<CaptureEvent>) {
        let mut watchdog = SilenceWatchdog::new(self.quiet_period);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Read the flag before polling so the drain after exit is final.
            let has_exited = *exited.borrow();

            let delivered = match self.poll_once(&tx).await {
                Ok(n) => n,
                Err(()) => return,
            };
            watchdog.observe(delivered);

            if has_exited {
                if delivered == 0 {
                    debug!("sink capture: process exited and sinks drained");
                    break;
                }
                continue;
            }

            if let Some(idle) = watchdog.check(true) {
                if tx.send(CaptureEvent::Stalled { idle }).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Forward any new bytes from both sinks. `Err` means the receiver is gone.
    async fn poll_once(
        &mut self,
        tx: &mpsc::Sender<CaptureEvent>,
    ) -> std::result::Result<usize, ()> {
        let mut delivered = 0;
        if let Some(bytes) = self.stdout.read_new().await {
            delivered += bytes.len();
            tx.send(CaptureEvent::Stdout(bytes)).await.map_err(|_| ())?;
        }
        if let Some(bytes) = self.stderr.read_new().await {
            delivered += bytes.len();
            tx.send(CaptureEvent::Stderr(bytes)).await.map_err(|_| ())?;
        }
        Ok(delivered)
    }
}

/// Read position within one sink file.
#[derive(Debug)]
pub struct SinkCursor {
    path: PathBuf,
    offset: u64,
}

impl SinkCursor {
    /// Start reading `path` from offset zero.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the bytes written since the last call, if any.
    ///
    /// The offset advances by exactly the number of bytes returned; read
    /// failures are logged and retried on the next poll.
    pub async fn read_new(&mut self) -> Option<Bytes> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "sink stat failed");
                return None;
            }
        };
        if len <= self.offset {
            return None;
        }

        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "sink open failed");
                return None;
            }
        };
        if let Err(err) = file.seek(SeekFrom::Start(self.offset)).await {
            warn!(path = %self.path.display(), error = %err, "sink seek failed");
            return None;
        }

        let mut buf = Vec::new();
        if let Err(err) = file.take(len - self.offset).read_to_end(&mut buf).await {
            warn!(path = %self.path.display(), error = %err, "sink read failed");
            return None;
        }
        if buf.is_empty() {
            return None;
        }
        self.offset += buf.len() as u64;
        Some(Bytes::from(buf))
    }
}
