//! Fleet client: drives robot jobs through a WebSocket relay.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Job-control operations on top of the relay connection.
pub mod agent;
/// CLI parsing and TOML configuration.
pub mod config;
/// WebSocket relay connection manager.
pub mod connection;
/// Request/reply slots and subscriber fan-out.
pub mod dispatch;
/// Agent error type.
pub mod error;
/// Fixed-interval reconnection schedule.
pub mod reconnect;

pub use agent::{Agent, TerminalSession};
pub use error::AgentError;
