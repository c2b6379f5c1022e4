use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the fleet agent.
#[derive(Parser)]
#[command(name = "fleetc", about = "Robot fleet relay agent")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay WebSocket URL override.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Owner key override, used for config and network queries.
    #[arg(long, global = true)]
    pub owner_key: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new secret key.
    Keygen,
    /// Print the PeerId for the configured secret key.
    Identity,
    /// List robots with their online status.
    Robots,
    /// Dump the relay's network info.
    Network,
    /// List jobs on a robot.
    Jobs {
        /// Robot PeerId.
        robot: String,
    },
    /// Show details of one job.
    JobInfo {
        /// Robot PeerId.
        robot: String,
        /// Job id.
        job: String,
    },
    /// Start a job on a robot.
    StartJob {
        /// Robot PeerId.
        robot: String,
        /// Job type.
        job_type: String,
        /// Job arguments as a JSON document.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Attach an interactive terminal to a running job.
    Terminal {
        /// Robot PeerId.
        robot: String,
        /// Job id.
        job: String,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the relay server.
    pub relay: String,
    /// Owner authorization key for `/config` and `/network_info`.
    pub owner_key: String,
    /// Base64 secret key (32-byte seed or 64-byte seed and public key).
    pub secret_key: String,
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
    /// Request/reply settings.
    pub request: RequestConfig,
}

/// Fixed-interval reconnection parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Delay between reconnection attempts, in milliseconds.
    pub interval_ms: u64,
    /// Attempts before giving up until the next explicit connect.
    pub max_attempts: u32,
}

/// Request/reply parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RequestConfig {
    /// How long to wait for a reply, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay: "ws://localhost:8888".to_string(),
            owner_key: String::new(),
            secret_key: String::new(),
            reconnect: ReconnectConfig::default(),
            request: RequestConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl ReconnectConfig {
    /// Reconnection interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl RequestConfig {
    /// Reply timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AgentConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay.is_empty() {
            return Err("relay URL must not be empty".to_string());
        }
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            return Err(format!(
                "relay URL must start with ws:// or wss://, got: {}",
                self.relay
            ));
        }
        if self.reconnect.interval_ms == 0 {
            return Err("reconnect.interval_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_attempts == 0 {
            return Err("reconnect.max_attempts must be greater than 0".to_string());
        }
        if self.request.timeout_ms == 0 {
            return Err("request.timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let defaults = AgentConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relay", defaults.relay.as_str())?
        .set_default("owner_key", defaults.owner_key.as_str())?
        .set_default("secret_key", defaults.secret_key.as_str())?
        .set_default(
            "reconnect.interval_ms",
            defaults.reconnect.interval_ms as i64,
        )?
        .set_default(
            "reconnect.max_attempts",
            i64::from(defaults.reconnect.max_attempts),
        )?
        .set_default("request.timeout_ms", defaults.request.timeout_ms as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform-native config dir first, then ~/.config/fleetc/
        let native_path = dirs::config_dir().map(|d| d.join("fleetc").join("config.toml"));
        let xdg_path =
            dirs::home_dir().map(|d| d.join(".config").join("fleetc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // FLEETC_OWNER_KEY -> owner_key, FLEETC_RECONNECT__INTERVAL_MS -> reconnect.interval_ms
    builder = builder.add_source(
        config::Environment::with_prefix("FLEETC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: AgentConfig = settings.try_deserialize()?;

    Ok(config)
}
