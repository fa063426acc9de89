//! Output capture strategies.
//!
//! An [`OutputCapture`] decides how the agent's stdout/stderr bytes reach
//! the executor. Both implementations share one contract: bytes of each
//! stream arrive in order, exactly once, and the event channel closes only
//! after the process has exited and a final drain has delivered what it
//! wrote. Output written later by background processes it left behind is
//! not waited for.
//!
//! - [`PipeCapture`](super::pipe_capture::PipeCapture) reads the child's
//!   pipes directly.
//! - [`SinkFileCapture`](super::sink_capture::SinkFileCapture) redirects
//!   both streams to files and polls them by offset, for platforms where
//!   pipe delivery from native agent binaries is unreliable.
//!
//! The strategy is chosen once per executor via [`select_capture`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::pipe_capture::PipeCapture;
use super::sink_capture::SinkFileCapture;
use crate::config::AgentConfig;
use crate::Result;

/// Capacity of the capture → executor channel.
pub const CAPTURE_CHANNEL_CAPACITY: usize = 256;

/// Configured capture strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Sink files on Windows, pipes elsewhere.
    #[default]
    Auto,
    /// Direct pipe streaming.
    Pipe,
    /// Redirect to files and poll.
    SinkFile,
}

impl CaptureMode {
    /// Resolve [`CaptureMode::Auto`] for the current platform.
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if cfg!(windows) => Self::SinkFile,
            Self::Auto => Self::Pipe,
            other => other,
        }
    }
}

/// Unit of captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Bytes from the agent's stdout.
    Stdout(Bytes),
    /// Bytes from the agent's stderr.
    Stderr(Bytes),
    /// No bytes for the watchdog's quiet period while the process lives.
    Stalled {
        /// Length of the silence.
        idle: Duration,
    },
}

/// Strategy selected once per executor.
pub trait OutputCapture: Send + Sync + fmt::Debug {
    /// Resolved mode of this strategy.
    fn mode(&self) -> CaptureMode;

    /// Wire the child's stdout/stderr on `cmd` before it is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`](crate::AppError::Io) if sink files cannot be
    /// created.
    fn prepare(&self, cmd: &mut Command) -> Result<Box<dyn PreparedCapture>>;
}

/// Capture state between `prepare` and the spawned child.
pub trait PreparedCapture: Send {
    /// Start delivering bytes from `child` into `tx`.
    ///
    /// `exited` flips to `true` once the process has been reaped. The
    /// returned task drops `tx` when delivery is complete.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) if the child's
    /// handles are not available.
    fn start(
        self: Box<Self>,
        child: &mut Child,
        exited: watch::Receiver<bool>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<JoinHandle<()>>;
}

/// Build the capture strategy described by `config`.
#[must_use]
pub fn select_capture(config: &AgentConfig) -> Arc<dyn OutputCapture> {
    match config.capture.resolve() {
        CaptureMode::SinkFile => Arc::new(SinkFileCapture::new(
            config.poll_interval(),
            config.stall_period(),
        )),
        CaptureMode::Pipe | CaptureMode::Auto => Arc::new(PipeCapture),
    }
}
