//! Ping-target probing
//!
//! TCP targets are probed with a timed connect. ICMP needs raw sockets,
//! which the agent does not open; those targets are reported as
//! `unsupported` so the server still sees the configured list.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

use super::PingResult;
use crate::protocol::{PingTargetConfig, ProbeKind};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn probe_all(targets: &[PingTargetConfig]) -> Vec<PingResult> {
    let probes = targets.iter().map(probe);
    futures::future::join_all(probes).await
}

pub async fn probe(target: &PingTargetConfig) -> PingResult {
    let (latency_ms, status) = match target.kind {
        ProbeKind::Tcp => match tcp_connect_time(&target.host, target.port).await {
            Some(elapsed) => (Some(elapsed.as_secs_f64() * 1000.0), "ok"),
            None => (None, "timeout"),
        },
        ProbeKind::Icmp => (None, "unsupported"),
    };

    PingResult {
        name: target.name.clone(),
        host: target.host.clone(),
        kind: target.kind,
        port: target.port,
        latency_ms,
        packet_loss: if latency_ms.is_some() || status == "unsupported" { 0.0 } else { 100.0 },
        status: status.to_string(),
    }
}

async fn tcp_connect_time(host: &str, port: u16) -> Option<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "TCP probe failed");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_target_reports_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = probe(&PingTargetConfig {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            kind: ProbeKind::Tcp,
            port,
        })
        .await;

        assert_eq!(result.status, "ok");
        assert!(result.latency_ms.is_some());
        assert_eq!(result.packet_loss, 0.0);
    }

    #[tokio::test]
    async fn test_icmp_target_is_unsupported() {
        let result = probe(&PingTargetConfig {
            name: "dns".to_string(),
            host: "1.1.1.1".to_string(),
            kind: ProbeKind::Icmp,
            port: 80,
        })
        .await;

        assert_eq!(result.status, "unsupported");
        assert!(result.latency_ms.is_none());
    }
}
