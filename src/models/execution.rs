//! Execution-side models: agent status, decoded results, and the typed
//! event/outcome contract between the executor and the session manager.
//!
//! An execution produces zero or more [`ExecutionEvent`]s on a channel and
//! resolves to exactly one [`ExecutionOutcome`] (or an error when it never
//! started).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relay availability reported in heartbeats and status messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Ready to accept a command.
    #[default]
    Online,
    /// An execution is in flight.
    Busy,
    /// The agent binary was unusable at startup.
    Error,
}

/// Outbound transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// No socket; waiting for the next attempt.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket established.
    Connected,
}

/// Summary derived from the agent's terminal `result` line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionResult {
    /// Agent session the execution belonged to.
    pub session_id: Option<String>,
    /// Final answer text.
    pub result_text: String,
    /// Reported cost in USD.
    pub cost_usd: f64,
    /// Reported wall time in milliseconds.
    pub duration_ms: u64,
    /// Number of agent turns.
    pub num_turns: u64,
    /// Whether the agent flagged the result as an error.
    pub is_error: bool,
}

impl ExecutionResult {
    /// Build a result from a decoded `result` line.
    ///
    /// Missing fields fall back to zero / empty / `false`. Cost is read from
    /// `total_cost_usd`, then `cost_usd`.
    #[must_use]
    pub fn from_line(line: &Value, session_id: Option<String>) -> Self {
        let cost_usd = line
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .or_else(|| line.get("cost_usd").and_then(Value::as_f64))
            .unwrap_or(0.0);
        Self {
            session_id,
            result_text: line
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            cost_usd,
            duration_ms: line.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
            num_turns: line.get("num_turns").and_then(Value::as_u64).unwrap_or(0),
            is_error: line
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Prompt passed with `-p`.
    pub prompt: String,
    /// Session to continue with `--resume`.
    pub resume_session_id: Option<String>,
    /// Directory the agent runs in.
    pub working_directory: PathBuf,
    /// Tools passed with `--allowedTools`.
    pub allowed_tools: Vec<String>,
    /// Path passed with `--mcp-config`.
    pub mcp_config: Option<String>,
    /// Text passed with `--append-system-prompt`.
    pub append_system_prompt: Option<String>,
}

impl ExecuteOptions {
    /// Options for a fresh prompt in `working_directory`.
    #[must_use]
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            resume_session_id: None,
            working_directory: working_directory.into(),
            allowed_tools: Vec::new(),
            mcp_config: None,
            append_system_prompt: None,
        }
    }
}

/// Non-terminal events streamed while an execution runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// One decoded JSON object from the agent's stdout, verbatim.
    Message(Value),
    /// The agent's `result` line; emitted at most once, after its `Message`.
    Result(ExecutionResult),
    /// No output for the watchdog's quiet period while the process lives.
    Stalled {
        /// Length of the silence.
        idle: Duration,
    },
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process exited on its own.
    Exited {
        /// Exit code; `None` when terminated by a signal.
        code: Option<i32>,
        /// Captured side-channel text, attached only for unsuccessful exits.
        diagnostics: Option<String>,
    },
    /// The timeout fired first and the process was terminated.
    TimedOut {
        /// Configured limit.
        after: Duration,
    },
    /// `cancel()` fired first and the process was terminated.
    Cancelled,
}

impl ExecutionOutcome {
    /// Whether the process exited with code 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}
