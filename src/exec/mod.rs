//! Agent process execution and event streaming.
//!
//! - `decoder`: incremental NDJSON line framing over [`AnyDelimiterCodec`](tokio_util::codec::AnyDelimiterCodec).
//! - `capture`: the output capture strategy trait and its selection.
//! - `pipe_capture` / `sink_capture`: the two capture strategies.
//! - `watchdog`: silence advisory for polled output.
//! - `spawner`: argument construction, environment isolation, preflight, and
//!   process supervision.
//! - `executor`: one subprocess lifecycle with cancellation and timeout.

pub mod capture;
pub mod decoder;
pub mod executor;
pub mod pipe_capture;
pub mod sink_capture;
pub mod spawner;
pub mod watchdog;

pub use executor::{Executor, ExecutorConfig};
