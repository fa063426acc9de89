//! Controller-facing side of the relay.
//!
//! - `connection`: WebSocket lifecycle, heartbeats, reconnect.
//! - `manager`: admission and dispatch of inbound commands, relay of
//!   execution events.
//! - `writer`: outbound frame serialisation.
//! - `normalize`: agent event → [`StreamMessage`](crate::models::outbound::StreamMessage).
//! - `browse`: directory listings for `file_browse`.
//! - `backoff`: reconnect delay policy.

pub mod backoff;
pub mod browse;
pub mod connection;
pub mod manager;
pub mod normalize;
pub mod writer;

pub use connection::{RelayClient, RelayEndpoint};
pub use manager::{RelayEvent, RelayEventKind, SessionManager};
