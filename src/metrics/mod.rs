//! System metrics collection
//!
//! The connection layer only needs two things from a collector: a fresh
//! snapshot on every report tick, and a way to replace the ping-target list
//! when the server pushes new configuration. Both are called from different
//! tasks, so implementations keep the target list behind a lock.

pub mod probe;
pub mod system;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::protocol::PingTargetConfig;

pub use system::SystemCollector;

/// Source of metrics snapshots
#[async_trait::async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Take a point-in-time snapshot
    async fn collect(&self) -> SystemSnapshot;

    /// Replace the ping-target list wholesale; an empty list clears it
    fn set_ping_targets(&self, targets: Vec<PingTargetConfig>);
}

/// Ordered ping-target list shared between the reader and sender tasks.
///
/// Readers always observe either the old or the new list, never a mix.
#[derive(Debug, Default)]
pub struct PingTargets {
    targets: RwLock<Vec<PingTargetConfig>>,
}

impl PingTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, targets: Vec<PingTargetConfig>) {
        let mut guard = self.targets.write().unwrap_or_else(|e| e.into_inner());
        *guard = targets;
    }

    pub fn snapshot(&self) -> Vec<PingTargetConfig> {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Complete host snapshot sent in every `metrics` frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub os: OsInfo,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
    pub network: NetworkMetrics,
    /// Seconds since boot
    pub uptime: u64,
    pub load_average: LoadAverage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingMetrics>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
    pub kernel: String,
    pub arch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub brand: String,
    pub cores: usize,
    /// Average usage across cores (0-100)
    pub usage: f32,
    /// MHz
    pub frequency: u64,
    pub per_core: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub name: String,
    pub total: u64,
    pub used: u64,
    pub usage_percent: f32,
    pub mount_points: Vec<String>,
    pub file_system: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub interfaces: Vec<NetworkInterface>,
    pub total_rx: u64,
    pub total_tx: u64,
    /// Bytes per second since the previous snapshot
    pub rx_speed: u64,
    pub tx_speed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingMetrics {
    pub targets: Vec<PingResult>,
}

/// Outcome of probing one ping target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub name: String,
    pub host: String,
    #[serde(rename = "type")]
    pub kind: crate::protocol::ProbeKind,
    pub port: u16,
    pub latency_ms: Option<f64>,
    pub packet_loss: f64,
    pub status: String,
}
