//! Core type definitions and protocol constants for the fleet relay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A 32-byte Ed25519 public key.
pub type Pubkey = [u8; 32];

/// Relay actions understood by the agent.
pub mod action {
    /// Forward a signed envelope to the peer named in its `to` field.
    pub const SEND_SIGNED_MESSAGE: &str = "/send_signed_message";
    /// Start forwarding messages addressed to the peer in `action_param`.
    pub const SUBSCRIBE_MESSAGES: &str = "/subscribe_messages";
    /// Fetch the fleet configuration (requires the owner key).
    pub const CONFIG: &str = "/config";
    /// Fetch the relay's view of peer connectivity (requires the owner key).
    pub const NETWORK_INFO: &str = "/network_info";
}

/// Lifecycle state of a job on a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Requested but not yet picked up by the robot.
    #[default]
    Pending,
    /// Currently running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// A status string this client does not know about.
    #[serde(other)]
    Unknown,
}

/// A job as reported by a robot, or created optimistically when the client
/// issues a start request.
///
/// Robots are not consistent about field names, so `job_id` and `job_type`
/// are accepted as aliases. Ids and timestamps may arrive as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier (a UUID when created by this client).
    #[serde(alias = "job_id", deserialize_with = "string_or_number")]
    pub id: String,
    /// Job kind, e.g. `"ping"` or `"custom_cmd"`.
    #[serde(rename = "type", alias = "job_type", default)]
    pub kind: String,
    /// Current status.
    #[serde(default)]
    pub status: JobStatus,
    /// Unix timestamp (seconds) as sent on the wire.
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
    /// Peer that runs the job.
    #[serde(default)]
    pub robot_peer_id: String,
    /// Job arguments, if the robot reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("expected string or number, got {other}"))),
    }
}

/// Reachability of a robot as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobotStatus {
    /// The relay reports the robot as online.
    Online,
    /// Offline, or not present in the network info.
    Unknown,
}

/// A robot registered in the fleet configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    /// Display name.
    pub name: String,
    /// The robot's PeerId.
    pub robot_peer_id: String,
    /// Reachability, filled in from network info.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RobotStatus>,
}

/// An operator allowed to talk to the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Display name.
    pub username: String,
    /// Base64 public key.
    pub public_key: String,
}

/// Fleet configuration returned by the relay's `/config` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Registered robots.
    #[serde(default)]
    pub robots: Vec<Robot>,
    /// Registered users.
    #[serde(default)]
    pub users: Vec<User>,
    /// Configuration revision.
    #[serde(default)]
    pub version: u64,
}

/// One peer's entry in the relay's network info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPeer {
    /// The peer's PeerId.
    pub peer_id: String,
    /// PeerIds this peer is connected to.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Unix timestamp of the last handshake.
    #[serde(default)]
    pub last_handshake: i64,
    /// Whether the relay currently considers the peer online.
    #[serde(default)]
    pub is_online: bool,
    /// Raw public key bytes.
    #[serde(default)]
    pub public_key: Vec<u8>,
}

/// PeerId → connectivity entry, as returned by `/network_info`.
pub type NetworkInfo = HashMap<String, NetworkPeer>;
