//! Team configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Overrides the network key (URL-safe base64, 32 bytes).
pub const ENV_KEY: &str = "AGENT_HUDDLE_KEY";
/// Default coordinator address used by `join` when none is passed.
pub const ENV_BROKER: &str = "AGENT_HUDDLE_BROKER";
/// Listener host used when this node becomes the coordinator.
pub const ENV_SYNC_HOST: &str = "AGENT_HUDDLE_SYNC_HOST";
/// Listener port used when this node becomes the coordinator.
pub const ENV_SYNC_PORT: &str = "AGENT_HUDDLE_SYNC_PORT";
/// Heartbeat interval in seconds.
pub const ENV_SYNC_INTERVAL: &str = "AGENT_HUDDLE_SYNC_INTERVAL";

fn default_sync_host() -> String {
    "127.0.0.1".into()
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_node_name() -> String {
    env::var("USER")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "operator".into())
}

/// Configuration for one team node, parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TeamConfig {
    /// Root directory holding one sub-directory per team plus `secrets/`.
    pub root: PathBuf,
    /// Human-readable node name advertised at registration.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Host the coordinator listener binds to.
    #[serde(default = "default_sync_host")]
    pub sync_host: String,
    /// Port the coordinator listener binds to; 0 picks an ephemeral port.
    #[serde(default)]
    pub sync_port: u16,
    /// Coordinator address used by `join` when the caller passes none.
    #[serde(default)]
    pub broker: Option<String>,
    /// Seconds between heartbeat notifications.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Upper bound for outbound team requests; 0 means wait forever.
    #[serde(default)]
    pub request_timeout_seconds: u64,
    /// Stop the heartbeat task immediately on `leave` instead of on its next tick.
    #[serde(default)]
    pub cancel_heartbeat_on_leave: bool,
    /// URL-safe base64 network key; overrides the key file under `secrets/`.
    #[serde(default)]
    pub network_key: Option<String>,
}

impl TeamConfig {
    /// Build a configuration rooted at `root` with every other field defaulted.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            node_name: default_node_name(),
            sync_host: default_sync_host(),
            sync_port: 0,
            broker: None,
            heartbeat_interval_seconds: default_heartbeat_interval(),
            request_timeout_seconds: 0,
            cancel_heartbeat_on_leave: false,
            network_key: None,
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENT_HUDDLE_*` environment overrides on top of the parsed values.
    ///
    /// Unparseable numeric overrides are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the resulting configuration is invalid.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(key) = env::var(ENV_KEY) {
            if !key.is_empty() {
                self.network_key = Some(key);
            }
        }
        if let Ok(broker) = env::var(ENV_BROKER) {
            if !broker.is_empty() {
                self.broker = Some(broker);
            }
        }
        if let Ok(host) = env::var(ENV_SYNC_HOST) {
            if !host.is_empty() {
                self.sync_host = host;
            }
        }
        if let Ok(raw) = env::var(ENV_SYNC_PORT) {
            match raw.parse::<u16>() {
                Ok(port) => self.sync_port = port,
                Err(err) => warn!(value = %raw, %err, "ignoring invalid {ENV_SYNC_PORT}"),
            }
        }
        if let Ok(raw) = env::var(ENV_SYNC_INTERVAL) {
            match raw.parse::<u64>() {
                Ok(seconds) => self.heartbeat_interval_seconds = seconds,
                Err(err) => warn!(value = %raw, %err, "ignoring invalid {ENV_SYNC_INTERVAL}"),
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Interval between heartbeat notifications.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Optional bound applied to outbound team requests.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_seconds > 0).then(|| Duration::from_secs(self.request_timeout_seconds))
    }

    /// Directory holding the persisted documents of `team_id`.
    #[must_use]
    pub fn team_dir(&self, team_id: &str) -> PathBuf {
        self.root.join(team_id)
    }

    /// Directory holding the generated network key.
    #[must_use]
    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    /// Address the coordinator listener binds to.
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.sync_host, self.sync_port)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.sync_host.trim().is_empty() {
            return Err(AppError::Config("sync_host must not be empty".into()));
        }

        if self.node_name.trim().is_empty() {
            return Err(AppError::Config("node_name must not be empty".into()));
        }

        Ok(())
    }
}
