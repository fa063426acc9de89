//! Session manager: admission, command dispatch, and event relay.
//!
//! The manager is owned by a single task (the connection loop) and mutated
//! only through `&mut self`. It holds at most one active [`Executor`]; a
//! second `command`/`resume` while one is running is rejected, never queued.
//!
//! Each accepted execution runs in its own task that tags the executor's
//! events with the `request_id` and forwards them, in order, over the
//! manager's event channel, ending with exactly one
//! [`RelayEventKind::Finished`]. The manager reports exactly one terminal
//! message per request (`result` or `error`) and ignores anything an
//! execution emits after that.
//!
//! An execution that reported its result may still be running while the
//! agent winds down. It is kept as the finishing execution until its task
//! ends, and is terminated before another execution is started or when the
//! relay shuts down, so at most one agent process is ever live.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::exec::Executor;
use crate::models::command::{decode_command, Command, CommandKind};
use crate::models::execution::{
    AgentStatus, ExecuteOptions, ExecutionEvent, ExecutionOutcome, ExecutionResult,
};
use crate::models::outbound::{Heartbeat, OutboundMessage};
use crate::relay::browse::{list_directory, resolve_browse_path};
use crate::relay::normalize::normalize_event;
use crate::system_info::SystemInfoProvider;
use crate::{AppError, Result};

/// Capacity of the manager's inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Capacity of each execution's private event channel.
const EXECUTION_CHANNEL_CAPACITY: usize = 128;

/// Extra time allowed for a cancelled execution to be reaped.
const SHUTDOWN_REAP_SLACK: Duration = Duration::from_secs(1);

/// Event forwarded from an execution task to the manager.
#[derive(Debug)]
pub struct RelayEvent {
    /// Command the execution belongs to.
    pub request_id: String,
    /// What happened.
    pub kind: RelayEventKind,
}

/// Payload of a [`RelayEvent`].
#[derive(Debug)]
pub enum RelayEventKind {
    /// Streamed executor event.
    Stream(ExecutionEvent),
    /// The execution ended; always the last event for its request.
    Finished(Result<ExecutionOutcome>),
}

/// An execution and the task relaying its events.
#[derive(Debug)]
struct ActiveExecution {
    request_id: String,
    executor: Arc<Executor>,
    task: JoinHandle<()>,
}

/// Owns admission state and the outbound relay.
#[derive(Debug)]
pub struct SessionManager {
    agent_id: String,
    config: Arc<GlobalConfig>,
    system: SystemInfoProvider,
    status: AgentStatus,
    unavailable: Option<String>,
    active: Option<ActiveExecution>,
    finishing: Option<ActiveExecution>,
    last_settled: Option<String>,
    last_session_id: Option<String>,
    outbound: Option<mpsc::Sender<OutboundMessage>>,
    events_tx: mpsc::Sender<RelayEvent>,
    shutting_down: bool,
}

impl SessionManager {
    /// Create a manager and the receiver its execution tasks report to.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        config: Arc<GlobalConfig>,
        system: SystemInfoProvider,
    ) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            agent_id: agent_id.into(),
            config,
            system,
            status: AgentStatus::Online,
            unavailable: None,
            active: None,
            finishing: None,
            last_settled: None,
            last_session_id: None,
            outbound: None,
            events_tx,
            shutting_down: false,
        };
        (manager, events_rx)
    }

    /// Put the manager in the terminal `error` state after a failed startup
    /// check; executions are rejected with `reason`.
    pub fn mark_unavailable(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason, "agent unavailable");
        self.unavailable = Some(reason);
        self.status = AgentStatus::Error;
    }

    /// Current availability.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Relay identity.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Request id of the running execution.
    #[must_use]
    pub fn active_request_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.request_id.as_str())
    }

    /// Request id of an execution that already reported its result but
    /// whose process has not exited yet.
    #[must_use]
    pub fn finishing_request_id(&self) -> Option<&str> {
        self.finishing.as_ref().map(|f| f.request_id.as_str())
    }

    /// Agent session of the running execution.
    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        self.active
            .as_ref()
            .and_then(|a| a.executor.current_session_id())
    }

    /// Most recent agent session seen; used by `resume` without an id.
    #[must_use]
    pub fn last_session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    /// Whether graceful shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Route outbound messages to a freshly connected transport.
    pub fn attach(&mut self, outbound: mpsc::Sender<OutboundMessage>) {
        self.outbound = Some(outbound);
    }

    /// Stop routing outbound messages; later messages are dropped.
    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Decode and dispatch one inbound text frame.
    pub async fn handle_text(&mut self, raw: &str) {
        match decode_command(raw) {
            Ok(command) => self.handle_command(command).await,
            Err(rejection) => {
                warn!(request_id = %rejection.request_id, error = %rejection.error, "rejected inbound frame");
                self.send(OutboundMessage::error(
                    rejection.request_id,
                    rejection.error.to_string(),
                ))
                .await;
            }
        }
    }

    /// Dispatch a decoded command.
    pub async fn handle_command(&mut self, command: Command) {
        let span = info_span!("command", request_id = %command.request_id, kind = %command.kind);
        async {
            info!("command received");
            match command.kind {
                CommandKind::Command | CommandKind::Resume => self.start_execution(command).await,
                CommandKind::Cancel => self.cancel_execution(&command).await,
                CommandKind::FileBrowse => self.browse(&command).await,
            }
        }
        .instrument(span)
        .await;
    }

    async fn start_execution(&mut self, command: Command) {
        if let Err(err) = self.admit() {
            warn!(error = %err, "command rejected");
            self.send(OutboundMessage::error(command.request_id, err.to_string()))
                .await;
            return;
        }

        let resume_session_id = match command.kind {
            CommandKind::Resume => {
                match command.session_id.clone().or_else(|| self.last_session_id.clone()) {
                    Some(id) => Some(id),
                    None => {
                        let err = AppError::Protocol("resume requires a session_id".into());
                        self.send(OutboundMessage::error(command.request_id, err.to_string()))
                            .await;
                        return;
                    }
                }
            }
            _ => None,
        };

        let options = ExecuteOptions {
            prompt: command.prompt,
            resume_session_id,
            working_directory: self
                .config
                .resolve_working_directory(command.working_directory.as_deref()),
            allowed_tools: command
                .allowed_tools
                .unwrap_or_else(|| self.config.allowed_tools.clone()),
            mcp_config: command.mcp_config,
            append_system_prompt: self.config.agent.append_system_prompt.clone(),
        };

        if let Some(finishing) = self.finishing.take() {
            info!(request_id = %finishing.request_id, "stopping previous agent process before starting");
            self.reap(finishing).await;
        }

        let executor = Arc::new(Executor::from_agent_config(&self.config.agent));
        let task = self.spawn_execution(command.request_id.clone(), Arc::clone(&executor), options);

        info!(request_id = %command.request_id, "execution started");
        self.active = Some(ActiveExecution {
            request_id: command.request_id,
            executor,
            task,
        });
        self.set_status(AgentStatus::Busy).await;
    }

    /// Admission check for a new execution; has no side effects.
    fn admit(&self) -> Result<()> {
        if self.shutting_down {
            return Err(AppError::Busy("relay is shutting down".into()));
        }
        if let Some(reason) = &self.unavailable {
            return Err(AppError::Preflight(reason.clone()));
        }
        if let Some(active) = &self.active {
            return Err(AppError::Busy(format!(
                "agent is busy processing request {}",
                active.request_id
            )));
        }
        Ok(())
    }

    fn spawn_execution(
        &self,
        request_id: String,
        executor: Arc<Executor>,
        options: ExecuteOptions,
    ) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        let span = info_span!("execution", request_id = %request_id);

        tokio::spawn(
            async move {
                let (tx, mut rx) = mpsc::channel(EXECUTION_CHANNEL_CAPACITY);
                let run = executor.execute(options, tx);
                tokio::pin!(run);

                let outcome = loop {
                    tokio::select! {
                        biased;
                        Some(event) = rx.recv() => {
                            if !forward(&events_tx, &request_id, RelayEventKind::Stream(event)).await {
                                return;
                            }
                        }
                        outcome = &mut run => break outcome,
                    }
                };

                // The sender was dropped with the finished future; drain the rest.
                while let Some(event) = rx.recv().await {
                    if !forward(&events_tx, &request_id, RelayEventKind::Stream(event)).await {
                        return;
                    }
                }
                forward(&events_tx, &request_id, RelayEventKind::Finished(outcome)).await;
            }
            .instrument(span),
        )
    }

    /// Cancel the running execution. The cancellation result is reported on
    /// the cancelled execution's request id; the cancel frame's own id is
    /// only answered when there is nothing to cancel.
    async fn cancel_execution(&mut self, command: &Command) {
        let Some(active) = self.active.take() else {
            if let Some(finishing) = &self.finishing {
                finishing.executor.cancel();
            }
            if self.last_settled.as_deref() == Some(command.request_id.as_str()) {
                debug!(request_id = %command.request_id, "cancel for an already settled request");
                return;
            }
            self.send(OutboundMessage::error(
                command.request_id.clone(),
                "no execution in progress to cancel",
            ))
            .await;
            return;
        };

        info!(cancelled_request = %active.request_id, "cancelling execution");
        active.executor.cancel();
        let session_id = active.executor.current_session_id();
        self.remember_session(session_id.clone());
        self.last_settled = Some(active.request_id.clone());

        self.send(OutboundMessage::Result {
            request_id: active.request_id.clone(),
            session_id,
            message: Some("Execution cancelled".into()),
            cost_usd: 0.0,
            duration_ms: 0,
            num_turns: 0,
            is_error: false,
        })
        .await;
        self.retire(active);
        self.settle_status().await;
    }

    async fn browse(&mut self, command: &Command) {
        let fallback = self.config.resolve_working_directory(None);
        let dir = resolve_browse_path(
            command.path.as_deref(),
            command.working_directory.as_deref(),
            &fallback,
        );
        let path = dir.to_string_lossy().into_owned();

        let message = match list_directory(&dir).await {
            Ok(entries) => {
                debug!(%path, count = entries.len(), "directory listed");
                OutboundMessage::FileBrowseResult {
                    request_id: command.request_id.clone(),
                    path,
                    entries,
                    error: None,
                }
            }
            Err(err) => {
                warn!(%path, error = %err, "directory listing failed");
                OutboundMessage::FileBrowseResult {
                    request_id: command.request_id.clone(),
                    path,
                    entries: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        self.send(message).await;
    }

    /// Apply one event from an execution task.
    pub async fn handle_event(&mut self, event: RelayEvent) {
        if self
            .finishing
            .as_ref()
            .is_some_and(|f| f.request_id == event.request_id)
        {
            if matches!(event.kind, RelayEventKind::Finished(_)) {
                debug!(request_id = %event.request_id, "finishing execution exited");
                self.finishing = None;
            }
            return;
        }

        let Some(active) = self
            .active
            .as_ref()
            .filter(|a| a.request_id == event.request_id)
        else {
            debug!(request_id = %event.request_id, "ignoring event for settled request");
            return;
        };
        let request_id = active.request_id.clone();
        let executor = Arc::clone(&active.executor);

        match event.kind {
            RelayEventKind::Stream(ExecutionEvent::Message(value)) => {
                let message = normalize_event(&value);
                self.send(OutboundMessage::Stream {
                    request_id,
                    session_id: executor.current_session_id(),
                    message,
                })
                .await;
            }
            RelayEventKind::Stream(ExecutionEvent::Result(result)) => {
                self.complete(&request_id, &result).await;
            }
            RelayEventKind::Stream(ExecutionEvent::Stalled { idle }) => {
                self.send(OutboundMessage::Status {
                    request_id: Some(request_id),
                    status: self.status,
                    message: Some(format!(
                        "agent may be stalled: no output for {}s",
                        idle.as_secs()
                    )),
                })
                .await;
            }
            RelayEventKind::Finished(outcome) => {
                let error = describe_failure(&outcome);
                self.active = None;
                self.last_settled = Some(request_id.clone());
                self.remember_session(executor.current_session_id());
                warn!(%request_id, %error, "execution ended without a result");
                self.send(OutboundMessage::Error {
                    request_id,
                    session_id: executor.current_session_id(),
                    error,
                })
                .await;
                self.settle_status().await;
            }
        }
    }

    async fn complete(&mut self, request_id: &str, result: &ExecutionResult) {
        info!(
            request_id,
            session_id = result.session_id.as_deref(),
            is_error = result.is_error,
            "execution produced a result"
        );
        if let Some(done) = self.active.take() {
            self.retire(done);
        }
        self.last_settled = Some(request_id.to_owned());
        self.remember_session(result.session_id.clone());
        self.send(OutboundMessage::result(request_id, result)).await;
        self.settle_status().await;
    }

    /// Keep a settled execution until its process exits.
    fn retire(&mut self, execution: ActiveExecution) {
        if let Some(previous) = self.finishing.replace(execution) {
            previous.executor.cancel();
        }
    }

    fn remember_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            self.last_session_id = Some(id);
        }
    }

    /// Build a heartbeat for the current state.
    #[must_use]
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            agent_id: self.agent_id.clone(),
            status: self.status,
            system_info: self.system.snapshot(),
            current_session: self.current_session_id(),
            timestamp: Utc::now(),
        }
    }

    /// Send a heartbeat; failures are not retried.
    pub async fn send_heartbeat(&mut self) {
        let heartbeat = self.heartbeat();
        debug!(status = ?heartbeat.status, "sending heartbeat");
        self.send(OutboundMessage::Heartbeat(heartbeat)).await;
    }

    /// Report the current status (sent on every connect).
    pub async fn announce_status(&mut self) {
        self.send(OutboundMessage::Status {
            request_id: None,
            status: self.status,
            message: self.unavailable.clone(),
        })
        .await;
    }

    /// React to transport loss: the running execution is cancelled and
    /// abandoned; nothing is buffered for replay.
    pub fn on_transport_lost(&mut self) {
        self.outbound = None;
        if let Some(active) = self.active.take() {
            warn!(
                request_id = %active.request_id,
                "transport lost during execution, cancelling"
            );
            active.executor.cancel();
            self.remember_session(active.executor.current_session_id());
            self.last_settled = Some(active.request_id.clone());
            self.retire(active);
        }
        if let Some(finishing) = &self.finishing {
            finishing.executor.cancel();
        }
        if self.unavailable.is_none() {
            self.status = AgentStatus::Online;
        }
    }

    /// Begin graceful shutdown: refuse new work, cancel the running
    /// execution, report it failed, and wait briefly for every agent
    /// process to be reaped.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("session manager shutting down");

        if let Some(active) = self.active.take() {
            active.executor.cancel();
            self.last_settled = Some(active.request_id.clone());
            self.send(OutboundMessage::Error {
                request_id: active.request_id.clone(),
                session_id: active.executor.current_session_id(),
                error: "relay is shutting down; execution cancelled".into(),
            })
            .await;
            self.reap(active).await;
        }
        if let Some(finishing) = self.finishing.take() {
            self.reap(finishing).await;
        }
    }

    /// Cancel `execution` and wait for its task, aborting it if the process
    /// outlives the termination grace period.
    async fn reap(&self, execution: ActiveExecution) {
        execution.executor.cancel();
        let grace = self.config.agent.termination_grace() + SHUTDOWN_REAP_SLACK;
        let mut task = execution.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(request_id = %execution.request_id, "execution did not stop in time, aborting");
            task.abort();
        }
    }

    async fn set_status(&mut self, status: AgentStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.announce_status().await;
    }

    async fn settle_status(&mut self) {
        let status = if self.unavailable.is_some() {
            AgentStatus::Error
        } else {
            AgentStatus::Online
        };
        self.set_status(status).await;
    }

    async fn send(&mut self, message: OutboundMessage) {
        let Some(outbound) = &self.outbound else {
            debug!(kind = message.kind(), "transport detached, dropping outbound message");
            return;
        };
        if outbound.send(message).await.is_err() {
            debug!("outbound channel closed, detaching");
            self.outbound = None;
        }
    }
}

/// Forward one event; `false` when the manager is gone.
async fn forward(events_tx: &mpsc::Sender<RelayEvent>, request_id: &str, kind: RelayEventKind) -> bool {
    let event = RelayEvent {
        request_id: request_id.to_owned(),
        kind,
    };
    if events_tx.send(event).await.is_err() {
        debug!(request_id, "manager gone, dropping execution events");
        return false;
    }
    true
}

/// Human-readable explanation for an execution that ended without a result.
#[must_use]
pub fn describe_failure(outcome: &Result<ExecutionOutcome>) -> String {
    match outcome {
        Err(err) => err.to_string(),
        Ok(ExecutionOutcome::Exited {
            code: Some(0), ..
        }) => "agent exited without producing a result".to_owned(),
        Ok(ExecutionOutcome::Exited { code, diagnostics }) => {
            let head = code.map_or_else(
                || "agent process was terminated by a signal".to_owned(),
                |c| format!("agent process exited with code {c}"),
            );
            match diagnostics {
                Some(text) => format!("{head}: {text}"),
                None => head,
            }
        }
        Ok(ExecutionOutcome::TimedOut { after }) => AppError::Timeout(format!(
            "agent did not finish within {}s",
            after.as_secs()
        ))
        .to_string(),
        Ok(ExecutionOutcome::Cancelled) => "execution cancelled".to_owned(),
    }
}
