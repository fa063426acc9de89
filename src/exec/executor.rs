//! Single-execution agent runner.
//!
//! An [`Executor`] owns one agent subprocess from spawn to exit:
//!
//! 1. optional preflight of the agent binary;
//! 2. spawn with the capture strategy chosen at construction;
//! 3. capture → [`LineDecoder`] → JSON interpretation, streaming
//!    [`ExecutionEvent`]s on the caller's channel;
//! 4. resolve to one [`ExecutionOutcome`] once the process has exited and the
//!    decoder has been flushed.
//!
//! Cancellation, timeout, and natural exit race; the first one decides the
//! outcome and the others become no-ops. Executors are single-use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::capture::{select_capture, CaptureEvent, OutputCapture, CAPTURE_CHANNEL_CAPACITY};
use super::decoder::LineDecoder;
use super::spawner::{build_command, probe_version, resolve_binary, supervise};
use crate::config::AgentConfig;
use crate::models::execution::{ExecuteOptions, ExecutionEvent, ExecutionOutcome, ExecutionResult};
use crate::{AppError, Result};

/// Maximum diagnostic text retained for a failed exit (tail is kept).
pub const DIAGNOSTICS_LIMIT: usize = 8 * 1024;

/// Executor settings, derived from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent binary name or path.
    pub binary: String,
    /// Wall-clock limit; `None` disables the timer.
    pub timeout: Option<Duration>,
    /// Run the preflight check before spawning.
    pub preflight: bool,
    /// Time between SIGTERM and a forced kill.
    pub termination_grace: Duration,
}

impl From<&AgentConfig> for ExecutorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.timeout(),
            preflight: config.preflight,
            termination_grace: config.termination_grace(),
        }
    }
}

/// What ended the execution early, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    TimedOut(Duration),
}

/// Runs one agent invocation.
#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
    capture: Arc<dyn OutputCapture>,
    cancel: CancellationToken,
    session_tx: watch::Sender<Option<String>>,
    started: AtomicBool,
}

impl Executor {
    /// Create an executor with an explicit capture strategy.
    #[must_use]
    pub fn new(config: ExecutorConfig, capture: Arc<dyn OutputCapture>) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            config,
            capture,
            cancel: CancellationToken::new(),
            session_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Create an executor whose capture strategy is selected from `config`.
    #[must_use]
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self::new(ExecutorConfig::from(config), select_capture(config))
    }

    /// Capture strategy in use.
    #[must_use]
    pub fn capture(&self) -> &Arc<dyn OutputCapture> {
        &self.capture
    }

    /// Agent session id observed so far in this execution.
    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        self.session_tx.borrow().clone()
    }

    /// Request termination of the running process.
    ///
    /// Safe to call any number of times, before start, or after exit.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("executor cancel requested");
        }
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the agent to completion, streaming events into `events`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Execution`] if this executor was already used.
    /// - [`AppError::Preflight`] if the binary is missing or broken.
    /// - [`AppError::Spawn`] if the process cannot be started.
    ///
    /// Runtime failures of the agent are reported through the returned
    /// [`ExecutionOutcome`], never as errors.
    pub async fn execute(
        &self,
        options: ExecuteOptions,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Result<ExecutionOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Execution("executor already used".into()));
        }

        let span = info_span!(
            "execute",
            binary = %self.config.binary,
            workdir = %options.working_directory.display(),
            resume = options.resume_session_id.is_some(),
        );
        self.run(options, events).instrument(span).await
    }

    async fn run(
        &self,
        options: ExecuteOptions,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Result<ExecutionOutcome> {
        let program = if self.config.preflight {
            let version = probe_version(&self.config.binary).await?;
            debug!(version, "preflight passed");
            resolve_binary(&self.config.binary)?
        } else {
            self.config.binary.clone().into()
        };

        if let Some(resume) = options.resume_session_id.clone() {
            self.session_tx.send_replace(Some(resume));
        }

        if self.cancel.is_cancelled() {
            info!("execution cancelled before spawn");
            return Ok(ExecutionOutcome::Cancelled);
        }

        let mut cmd = build_command(&program, &options);
        let prepared = self.capture.prepare(&mut cmd)?;

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!(
                "failed to spawn agent `{}`: {err}",
                self.config.binary
            ))
        })?;
        let pid = child.id();
        info!(pid, capture = ?self.capture.mode(), "agent process spawned");

        let (exited_tx, exited_rx) = watch::channel(false);
        let (capture_tx, mut capture_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let capture_task = match prepared.start(&mut child, exited_rx.clone(), capture_tx) {
            Ok(task) => task,
            Err(err) => {
                let _ = child.start_kill();
                return Err(err);
            }
        };

        let kill = CancellationToken::new();
        let supervisor = supervise(child, kill.clone(), self.config.termination_grace, exited_tx);
        // Terminates the process if this future is dropped before it exits.
        let _kill_on_drop = kill.clone().drop_guard();

        let mut decoder = LineDecoder::new();
        let mut stream = StreamState::new(&self.session_tx, &events);
        let mut interruption: Option<Interruption> = None;
        let mut cancel_seen = false;

        let timeout = self.config.timeout;
        let timer = tokio::time::sleep(timeout.unwrap_or(Duration::ZERO));
        tokio::pin!(timer);
        let mut timer_armed = timeout.is_some();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    if interruption.is_none() && !*exited_rx.borrow() {
                        info!(pid, "execution cancelled");
                        interruption = Some(Interruption::Cancelled);
                        kill.cancel();
                    }
                }

                () = &mut timer, if timer_armed => {
                    timer_armed = false;
                    if interruption.is_none() && !*exited_rx.borrow() {
                        let after = timeout.unwrap_or_default();
                        warn!(pid, timeout_secs = after.as_secs(), "execution timed out");
                        interruption = Some(Interruption::TimedOut(after));
                        kill.cancel();
                    }
                }

                event = capture_rx.recv() => match event {
                    Some(CaptureEvent::Stdout(bytes)) => {
                        for line in decoder.feed(&bytes) {
                            stream.handle_line(&line).await;
                        }
                    }
                    Some(CaptureEvent::Stderr(bytes)) => {
                        stream.diagnostics.push(&String::from_utf8_lossy(&bytes));
                    }
                    Some(CaptureEvent::Stalled { idle }) => {
                        stream.emit(ExecutionEvent::Stalled { idle }).await;
                    }
                    None => break,
                },
            }
        }

        let status = match supervisor.await {
            Ok(status) => status,
            Err(join_err) => Err(std::io::Error::other(join_err.to_string())),
        };
        let _ = capture_task.await;

        if let Some(line) = decoder.finish() {
            stream.handle_line(&line).await;
        }

        let outcome = match interruption {
            Some(Interruption::Cancelled) => ExecutionOutcome::Cancelled,
            Some(Interruption::TimedOut(after)) => ExecutionOutcome::TimedOut { after },
            None => {
                let (code, success) = match &status {
                    Ok(s) => (s.code(), s.success()),
                    Err(err) => {
                        stream.diagnostics.push(&format!("wait error: {err}"));
                        (None, false)
                    }
                };
                ExecutionOutcome::Exited {
                    code,
                    diagnostics: if success {
                        None
                    } else {
                        stream.diagnostics.take()
                    },
                }
            }
        };

        info!(pid, ?outcome, "execution finished");
        Ok(outcome)
    }
}

/// Per-execution line interpretation state.
struct StreamState<'a> {
    session_tx: &'a watch::Sender<Option<String>>,
    events: &'a mpsc::Sender<ExecutionEvent>,
    diagnostics: Diagnostics,
    result_emitted: bool,
    receiver_gone: bool,
}

impl<'a> StreamState<'a> {
    fn new(
        session_tx: &'a watch::Sender<Option<String>>,
        events: &'a mpsc::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            session_tx,
            events,
            diagnostics: Diagnostics::default(),
            result_emitted: false,
            receiver_gone: false,
        }
    }

    async fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let value = match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => value,
            _ => {
                // Agents interleave plain diagnostics with structured lines.
                debug!(line, "skipping non-JSON agent output");
                self.diagnostics.push_line(line);
                return;
            }
        };

        if let Some(session_id) = value
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            let changed = self.session_tx.borrow().as_deref() != Some(session_id);
            if changed {
                debug!(session_id, "agent session id observed");
                self.session_tx.send_replace(Some(session_id.to_owned()));
            }
        }

        let is_result = value.get("type").and_then(Value::as_str) == Some("result");
        let result = (is_result && !self.result_emitted)
            .then(|| ExecutionResult::from_line(&value, self.session_tx.borrow().clone()));

        self.emit(ExecutionEvent::Message(value)).await;

        if let Some(result) = result {
            self.result_emitted = true;
            self.emit(ExecutionEvent::Result(result)).await;
        }
    }

    async fn emit(&mut self, event: ExecutionEvent) {
        if self.receiver_gone {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("execution event receiver dropped; continuing without streaming");
            self.receiver_gone = true;
        }
    }
}

/// Bounded side-channel text (stderr and non-JSON stdout).
#[derive(Debug, Default)]
struct Diagnostics {
    text: String,
}

impl Diagnostics {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > DIAGNOSTICS_LIMIT {
            let mut cut = self.text.len() - DIAGNOSTICS_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    fn push_line(&mut self, line: &str) {
        self.push(line);
        self.push("\n");
    }

    fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }
}
