//! Outbound wire messages (relay → remote controller).
//!
//! Every variant serialises as a flat JSON object tagged by `type`. All
//! command-related messages carry the originating `request_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::execution::{AgentStatus, ExecutionResult};
use crate::system_info::SystemSnapshot;

/// Normalised view of one agent stream event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    /// Speaker: `assistant`, `user`, `system`, …
    pub role: String,
    /// Concatenated text content (may be empty for tool-only events).
    pub content: String,
    /// Raw event classification.
    pub metadata: StreamMetadata,
}

/// Classification carried alongside a [`StreamMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMetadata {
    /// The event's `type` field.
    #[serde(rename = "type")]
    pub raw_type: String,
    /// The event's `subtype` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Tools announced or invoked by the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    /// File name (`..` for the parent entry).
    pub name: String,
    /// Absolute path.
    pub path: String,
    /// Whether the entry is a directory.
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
}

/// Periodic liveness report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Relay identity.
    pub agent_id: String,
    /// Current availability.
    pub status: AgentStatus,
    /// Host telemetry.
    pub system_info: SystemSnapshot,
    /// Agent session of the running execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session: Option<String>,
    /// Time the heartbeat was produced.
    pub timestamp: DateTime<Utc>,
}

/// Every message the relay sends to the remote controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A relayed agent stream event.
    Stream {
        /// Originating command.
        request_id: String,
        /// Agent session, once known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Normalised event.
        message: StreamMessage,
    },
    /// Terminal success (or agent-reported failure) of an execution.
    Result {
        /// Originating command.
        request_id: String,
        /// Agent session, once known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Final answer text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Reported cost in USD.
        cost_usd: f64,
        /// Reported wall time in milliseconds.
        duration_ms: u64,
        /// Number of agent turns.
        num_turns: u64,
        /// Whether the agent flagged its answer as an error.
        #[serde(default)]
        is_error: bool,
    },
    /// Terminal failure of a command.
    Error {
        /// Originating command.
        request_id: String,
        /// Agent session, once known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Human-readable explanation.
        error: String,
    },
    /// Availability change or advisory.
    Status {
        /// Related command, for advisories about a running execution.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Current availability.
        status: AgentStatus,
        /// Advisory text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Periodic liveness report.
    Heartbeat(Heartbeat),
    /// Response to `file_browse`.
    FileBrowseResult {
        /// Originating command.
        request_id: String,
        /// Directory that was listed.
        path: String,
        /// Listing (parent first, directories before files).
        entries: Vec<DirEntry>,
        /// Read failure, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundMessage {
    /// Error response for `request_id`.
    #[must_use]
    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            request_id: request_id.into(),
            session_id: None,
            error: error.into(),
        }
    }

    /// Result message for a completed execution.
    #[must_use]
    pub fn result(request_id: impl Into<String>, result: &ExecutionResult) -> Self {
        Self::Result {
            request_id: request_id.into(),
            session_id: result.session_id.clone(),
            message: Some(result.result_text.clone()),
            cost_usd: result.cost_usd,
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
            is_error: result.is_error,
        }
    }

    /// Correlation id, when the message belongs to a command.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Stream { request_id, .. }
            | Self::Result { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::FileBrowseResult { request_id, .. } => Some(request_id),
            Self::Status { request_id, .. } => request_id.as_deref(),
            Self::Heartbeat(_) => None,
        }
    }

    /// Wire `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stream { .. } => "stream",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
            Self::Heartbeat(_) => "heartbeat",
            Self::FileBrowseResult { .. } => "file_browse_result",
        }
    }
}
