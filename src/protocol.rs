//! Control-plane wire messages
//!
//! Every frame is a JSON text frame. Outbound: `auth` once per connection,
//! then `metrics` on every report tick. Inbound frames share one flat shape
//! whose populated fields depend on `type`.

use serde::{Deserialize, Serialize};

use crate::metrics::SystemSnapshot;

/// Credentials sent once, right after the socket opens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub server_id: String,
    pub token: String,
    pub version: String,
}

impl AuthMessage {
    pub fn new(server_id: &str, token: &str, version: &str) -> Self {
        Self {
            kind: "auth".to_string(),
            server_id: server_id.to_string(),
            token: token.to_string(),
            version: version.to_string(),
        }
    }
}

/// Periodic metrics frame
#[derive(Debug, Serialize)]
pub struct MetricsMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub metrics: &'a SystemSnapshot,
}

impl<'a> MetricsMessage<'a> {
    pub fn new(metrics: &'a SystemSnapshot) -> Self {
        Self {
            kind: "metrics",
            metrics,
        }
    }
}

/// Any frame sent by the collector
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_url: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ping_targets: Vec<PingTargetConfig>,
}

/// Probe protocol for a ping target.
///
/// Anything other than `tcp` is treated as ICMP, so one unrecognised `type`
/// cannot make a whole `config` frame undecodable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Tcp,
    #[default]
    #[serde(other)]
    Icmp,
}

/// A host the collector wants latency and loss for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTargetConfig {
    pub name: String,
    pub host: String,
    #[serde(rename = "type", default)]
    pub kind: ProbeKind,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

fn default_probe_port() -> u16 {
    80
}

/// Self-update request carried by a `command` frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateCommand {
    pub download_url: Option<String>,
    pub force: bool,
}

/// What an inbound frame asks the agent to do
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Server-side error report; logged only
    Error { message: String },
    /// `command` frame with `command = "update"`
    Update(UpdateCommand),
    /// `command` frame with any other command value
    UnknownCommand(String),
    /// Replacement ping-target list; empty means clear
    Config { ping_targets: Vec<PingTargetConfig> },
    /// Auth acks and unrecognised types
    Ignored,
}

impl ServerResponse {
    pub fn is_auth_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Classify a decoded frame for the steady-state dispatcher
    pub fn classify(self) -> InboundFrame {
        match self.kind.as_str() {
            "error" => InboundFrame::Error {
                message: self.message,
            },
            "command" if self.command == "update" => InboundFrame::Update(UpdateCommand {
                download_url: Some(self.download_url).filter(|url| !url.is_empty()),
                force: self.force,
            }),
            "command" => InboundFrame::UnknownCommand(self.command),
            "config" => InboundFrame::Config {
                ping_targets: self.ping_targets,
            },
            _ => InboundFrame::Ignored,
        }
    }
}
