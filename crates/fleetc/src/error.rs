use fleet_common::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A send was attempted while the relay socket is not open.
    #[error("relay connection is not open")]
    NotConnected,
    /// No matching reply arrived in time.
    #[error("no reply within {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Inbound data could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// A terminal command was sent before a session was started.
    #[error("terminal session not initialized")]
    SessionNotInitialized,
    /// Background reconnection gave up.
    #[error("gave up reconnecting after {0} attempts")]
    MaxReconnectAttemptsExceeded(u32),
    /// An outbound payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The configured secret key is unusable.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
