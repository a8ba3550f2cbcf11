//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

/// Collector endpoint and agent credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Collector URL (http(s):// or ws(s)://)
    pub url: String,

    /// Identifier this host was registered under
    pub server_id: String,

    /// Agent token issued at registration
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Seconds between metrics frames
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_initial_reconnect")]
    pub initial_reconnect_secs: u64,

    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_secs: u64,

    /// Bounds the dial and the auth reply
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Transport-level keepalive ping
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

/// Self-update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Prefix of the release artifact name (`{binary_name}-{os}-{arch}`)
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Service unit restarted after a successful install
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_release_api_base")]
    pub release_api_base: String,

    #[serde(default = "default_release_download_base")]
    pub release_download_base: String,

    #[serde(default = "default_release_owner")]
    pub release_owner: String,

    #[serde(default = "default_release_repo")]
    pub release_repo: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Pause after requesting a restart, before the process exits
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,
}

// Defaults
fn default_report_interval() -> u64 { 1 }
fn default_initial_reconnect() -> u64 { 5 }
fn default_max_reconnect() -> u64 { 60 }
fn default_auth_timeout() -> u64 { 10 }
fn default_ping_interval() -> u64 { 30 }
fn default_binary_name() -> String { "telemetry-agent".to_string() }
fn default_service_name() -> String { "telemetry-agent".to_string() }
fn default_release_api_base() -> String { "https://api.github.com".to_string() }
fn default_release_download_base() -> String { "https://github.com".to_string() }
fn default_release_owner() -> String { "telemetry-agent".to_string() }
fn default_release_repo() -> String { "telemetry-agent".to_string() }
fn default_user_agent() -> String { format!("telemetry-agent/{}", env!("CARGO_PKG_VERSION")) }
fn default_restart_grace() -> u64 { 500 }

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_report_interval(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_secs: default_initial_reconnect(),
            max_reconnect_secs: default_max_reconnect(),
            auth_timeout_secs: default_auth_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            binary_name: default_binary_name(),
            service_name: default_service_name(),
            release_api_base: default_release_api_base(),
            release_download_base: default_release_download_base(),
            release_owner: default_release_owner(),
            release_repo: default_release_repo(),
            user_agent: default_user_agent(),
            restart_grace_ms: default_restart_grace(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: String::new(),
                server_id: String::new(),
                token: String::new(),
            },
            report: ReportConfig::default(),
            connection: ConnectionConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configs the agent cannot connect with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.url.trim().is_empty() {
            return Err(ConfigError::Missing("server.url"));
        }
        if self.server.server_id.trim().is_empty() {
            return Err(ConfigError::Missing("server.server_id"));
        }
        if self.server.token.trim().is_empty() {
            return Err(ConfigError::Missing("server.token"));
        }
        if self.report.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "report.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.connection.initial_reconnect_secs == 0
            || self.connection.max_reconnect_secs < self.connection.initial_reconnect_secs
        {
            return Err(ConfigError::Invalid(
                "connection reconnect bounds must satisfy 0 < initial <= max".to_string(),
            ));
        }
        if self.connection.auth_timeout_secs == 0 || self.connection.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection auth_timeout_secs and ping_interval_secs must be at least 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// WebSocket endpoint derived from the configured collector URL.
    ///
    /// `ws://` and `wss://` URLs are used as given; `http(s)://` URLs are
    /// switched to the matching WebSocket scheme with `/ws` appended.
    pub fn ws_url(&self) -> String {
        let url = self.url.trim().trim_end_matches('/');
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return url.to_string();
        }
        if let Some(rest) = url.strip_prefix("https://") {
            return format!("wss://{}/ws", rest);
        }
        if let Some(rest) = url.strip_prefix("http://") {
            return format!("ws://{}/ws", rest);
        }
        format!("ws://{}/ws", url)
    }
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ConnectionConfig {
    pub fn initial_reconnect(&self) -> Duration {
        Duration::from_secs(self.initial_reconnect_secs)
    }

    pub fn max_reconnect(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
