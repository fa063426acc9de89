//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, validation, or persistence failure.
    Config(String),
    /// Agent binary is missing or does not answer its version probe.
    Preflight(String),
    /// The operating system refused to start the agent process.
    Spawn(String),
    /// Wall-clock execution limit exceeded.
    Timeout(String),
    /// Admission denied because another execution is in flight.
    Busy(String),
    /// Transport (WebSocket) failure.
    Connection(String),
    /// Inbound command could not be decoded or is invalid.
    Protocol(String),
    /// Executor misuse or unexpected execution failure.
    Execution(String),
    /// Directory listing failure.
    Browse(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether retrying the same request could succeed without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Connection(_) | Self::Timeout(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Preflight(msg) => write!(f, "preflight: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Busy(msg) => write!(f, "busy: {msg}"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::Browse(msg) => write!(f, "browse: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(format!("failed to serialize config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
