//! Domain models shared by the executor and the session manager.

pub mod command;
pub mod execution;
pub mod outbound;
