#![forbid(unsafe_code)]

//! `agent-relay`: runs a local coding agent on behalf of a remote controller.
//!
//! Commands arrive over a persistent WebSocket, each one runs the agent CLI
//! as a subprocess, and its NDJSON event stream is relayed back tagged with
//! the originating request.

pub mod config;
pub mod errors;
pub mod exec;
pub mod models;
pub mod relay;
pub mod system_info;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
