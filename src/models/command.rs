//! Inbound command model and envelope decoding.
//!
//! Commands arrive from the remote controller as single JSON text frames:
//!
//! ```json
//! {"type": "command", "request_id": "r1", "prompt": "fix the tests"}
//! {"type": "resume", "request_id": "r2", "session_id": "abc", "prompt": "continue"}
//! {"type": "cancel", "request_id": "r3"}
//! {"type": "file_browse", "request_id": "r4", "path": "/home/me/src"}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Recognised command verbs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Start a fresh agent execution.
    Command,
    /// Continue an earlier agent session.
    Resume,
    /// Terminate the running execution.
    Cancel,
    /// List a directory on the host.
    FileBrowse,
}

impl CommandKind {
    /// Wire name of the verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::FileBrowse => "file_browse",
        }
    }

    /// Whether this verb spawns the agent process.
    #[must_use]
    pub fn starts_execution(self) -> bool {
        matches!(self, Self::Command | Self::Resume)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "command" => Ok(Self::Command),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            "file_browse" => Ok(Self::FileBrowse),
            other => Err(AppError::Protocol(format!("unknown command type: {other}"))),
        }
    }
}

/// A decoded, validated inbound command. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command verb.
    pub kind: CommandKind,
    /// Correlation identifier echoed on every response.
    pub request_id: String,
    /// Agent session to continue (required for `resume`).
    pub session_id: Option<String>,
    /// Prompt text handed to the agent.
    pub prompt: String,
    /// Directory the agent runs in.
    pub working_directory: Option<String>,
    /// Tools the agent may use without asking.
    pub allowed_tools: Option<Vec<String>>,
    /// Path to an MCP server configuration file.
    pub mcp_config: Option<String>,
    /// Target directory for `file_browse`.
    pub path: Option<String>,
}

/// Raw wire envelope; every field is optional so that errors can still be
/// correlated by `request_id`.
#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    mcp_config: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

/// An inbound frame that could not be turned into a [`Command`].
#[derive(Debug)]
pub struct Rejection {
    /// Correlation id recovered from the frame (empty when absent).
    pub request_id: String,
    /// Why the frame was rejected.
    pub error: AppError,
}

impl Rejection {
    fn new(request_id: impl Into<String>, error: AppError) -> Self {
        Self {
            request_id: request_id.into(),
            error,
        }
    }
}

/// Decode one inbound text frame into a [`Command`].
///
/// # Errors
///
/// Returns a [`Rejection`] carrying [`AppError::Protocol`] when the frame is
/// not JSON, names an unknown `type`, lacks a `request_id`, or is missing a
/// prompt for `command` / `resume`.
pub fn decode_command(raw: &str) -> Result<Command, Rejection> {
    let envelope: CommandEnvelope = serde_json::from_str(raw)
        .map_err(|e| Rejection::new("", AppError::Protocol(format!("malformed json: {e}"))))?;

    let request_id = envelope.request_id.unwrap_or_default();

    let Some(raw_kind) = envelope.kind else {
        return Err(Rejection::new(
            request_id,
            AppError::Protocol("missing command type".into()),
        ));
    };
    let kind = match raw_kind.parse::<CommandKind>() {
        Ok(kind) => kind,
        Err(err) => return Err(Rejection::new(request_id, err)),
    };

    if request_id.is_empty() {
        return Err(Rejection::new(
            request_id,
            AppError::Protocol(format!("{kind} is missing request_id")),
        ));
    }

    let prompt = envelope.prompt.unwrap_or_default();
    if kind.starts_execution() && prompt.trim().is_empty() {
        return Err(Rejection::new(
            request_id,
            AppError::Protocol(format!("{kind} requires a non-empty prompt")),
        ));
    }

    Ok(Command {
        kind,
        request_id,
        session_id: envelope.session_id.filter(|s| !s.is_empty()),
        prompt,
        working_directory: envelope.working_directory,
        allowed_tools: envelope.allowed_tools,
        mcp_config: envelope.mcp_config.filter(|s| !s.is_empty()),
        path: envelope.path,
    })
}
