//! sysinfo-backed collector

use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use sysinfo::{Disks, Networks, System};

use super::{
    probe, CpuMetrics, DiskMetrics, LoadAverage, MemoryMetrics, MetricsCollector,
    NetworkInterface, NetworkMetrics, OsInfo, PingMetrics, PingTargets, SystemSnapshot,
};
use crate::protocol::PingTargetConfig;

struct CachedSystem {
    system: System,
    disks: Disks,
    networks: Networks,
    last_totals: Option<(Instant, u64, u64)>,
}

impl CachedSystem {
    fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            last_totals: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();
        self.disks.refresh_list();
        self.networks.refresh_list();
    }
}

/// Collector reading the local host through sysinfo
pub struct SystemCollector {
    cached: Mutex<CachedSystem>,
    ping_targets: PingTargets,
    version: String,
}

impl SystemCollector {
    pub fn new(version: &str) -> Self {
        Self {
            cached: Mutex::new(CachedSystem::new()),
            ping_targets: PingTargets::new(),
            version: version.to_string(),
        }
    }

    fn host_snapshot(&self) -> SystemSnapshot {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        cached.refresh();

        let network = collect_network(&mut cached);
        let load = System::load_average();

        SystemSnapshot {
            timestamp: Utc::now(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: OsInfo {
                name: System::name().unwrap_or_else(|| "unknown".to_string()),
                version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
                kernel: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
                arch: std::env::consts::ARCH.to_string(),
            },
            cpu: collect_cpu(&cached.system),
            memory: collect_memory(&cached.system),
            disks: collect_disks(&cached.disks),
            network,
            uptime: System::uptime(),
            load_average: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
            ping: None,
            version: self.version.clone(),
        }
    }
}

#[async_trait::async_trait]
impl MetricsCollector for SystemCollector {
    async fn collect(&self) -> SystemSnapshot {
        let mut snapshot = self.host_snapshot();

        let targets = self.ping_targets.snapshot();
        if !targets.is_empty() {
            snapshot.ping = Some(PingMetrics {
                targets: probe::probe_all(&targets).await,
            });
        }

        snapshot
    }

    fn set_ping_targets(&self, targets: Vec<PingTargetConfig>) {
        self.ping_targets.replace(targets);
    }
}

fn collect_cpu(sys: &System) -> CpuMetrics {
    let cpus = sys.cpus();
    let per_core: Vec<f32> = cpus.iter().map(|cpu| cpu.cpu_usage()).collect();
    let usage = if per_core.is_empty() {
        0.0
    } else {
        per_core.iter().sum::<f32>() / per_core.len() as f32
    };

    CpuMetrics {
        brand: cpus
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_else(|| "Unknown".to_string()),
        cores: cpus.len(),
        usage,
        frequency: cpus.first().map(|c| c.frequency()).unwrap_or(0),
        per_core,
    }
}

fn collect_memory(sys: &System) -> MemoryMetrics {
    let total = sys.total_memory();
    let used = sys.used_memory();

    MemoryMetrics {
        total,
        used,
        available: sys.available_memory(),
        swap_total: sys.total_swap(),
        swap_used: sys.used_swap(),
        usage_percent: percent(used, total),
    }
}

fn collect_disks(disks: &Disks) -> Vec<DiskMetrics> {
    disks
        .list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());

            DiskMetrics {
                name: disk.name().to_string_lossy().to_string(),
                total,
                used,
                usage_percent: percent(used, total),
                mount_points: vec![disk.mount_point().to_string_lossy().to_string()],
                file_system: disk.file_system().to_string_lossy().to_string(),
            }
        })
        .collect()
}

fn collect_network(cached: &mut CachedSystem) -> NetworkMetrics {
    let mut interfaces = Vec::new();
    let mut total_rx = 0u64;
    let mut total_tx = 0u64;

    for (name, data) in cached.networks.list() {
        if is_virtual_interface(name) {
            continue;
        }

        total_rx += data.total_received();
        total_tx += data.total_transmitted();

        interfaces.push(NetworkInterface {
            name: name.to_string(),
            mac: data.mac_address().to_string(),
            rx_bytes: data.total_received(),
            tx_bytes: data.total_transmitted(),
            rx_packets: data.total_packets_received(),
            tx_packets: data.total_packets_transmitted(),
        });
    }

    let now = Instant::now();
    let (rx_speed, tx_speed) = match cached.last_totals {
        Some((at, rx, tx)) => {
            let secs = now.duration_since(at).as_secs_f64();
            if secs > 0.0 {
                (
                    (total_rx.saturating_sub(rx) as f64 / secs) as u64,
                    (total_tx.saturating_sub(tx) as f64 / secs) as u64,
                )
            } else {
                (0, 0)
            }
        }
        None => (0, 0),
    };
    cached.last_totals = Some((now, total_rx, total_tx));

    NetworkMetrics {
        interfaces,
        total_rx,
        total_tx,
        rx_speed,
        tx_speed,
    }
}

/// Loopback, container and tunnel interfaces are excluded from totals
fn is_virtual_interface(name: &str) -> bool {
    let n = name.to_lowercase();
    n == "lo"
        || n == "lo0"
        || ["veth", "docker", "br-", "virbr", "utun", "awdl", "llw"]
            .iter()
            .any(|prefix| n.starts_with(prefix))
}

fn percent(part: u64, total: u64) -> f32 {
    if total > 0 {
        (part as f32 / total as f32) * 100.0
    } else {
        0.0
    }
}
