//! Platform capabilities
//!
//! Everything that differs per operating system goes through
//! [`PlatformOps`], selected once at startup and passed to the components
//! that need it.

use std::process::Command;
use tracing::{info, warn};

/// Operating-system family the agent runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformOps {
    Linux,
    Darwin,
    Windows,
    Unsupported,
}

impl PlatformOps {
    pub fn detect() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => PlatformOps::Linux,
            "macos" => PlatformOps::Darwin,
            "windows" => PlatformOps::Windows,
            _ => PlatformOps::Unsupported,
        }
    }

    /// OS segment of release artifact names
    pub fn release_os(&self) -> &'static str {
        match self {
            PlatformOps::Linux => "linux",
            PlatformOps::Darwin => "darwin",
            PlatformOps::Windows => "windows",
            PlatformOps::Unsupported => std::env::consts::OS,
        }
    }

    /// Release artifact for this platform, e.g. `telemetry-agent-linux-amd64`
    pub fn artifact_name(&self, binary_name: &str, arch: &str) -> String {
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        let name = format!("{}-{}-{}", binary_name, self.release_os(), arch);
        if *self == PlatformOps::Windows {
            format!("{}.exe", name)
        } else {
            name
        }
    }

    /// Whether a downloaded binary needs its execute bit set
    pub fn needs_exec_bit(&self) -> bool {
        *self != PlatformOps::Windows
    }

    /// Restart commands in the order they are tried.
    ///
    /// On Linux the first command runs `systemctl restart` inside a new
    /// transient unit, outside the agent's cgroup, so stopping the agent
    /// does not kill it. The second is the plain fallback.
    pub fn restart_commands(&self, service: &str) -> Vec<Command> {
        match self {
            PlatformOps::Linux => {
                let mut detached = Command::new("systemd-run");
                detached.args(["--no-block", "systemctl", "restart", service]);

                let mut direct = Command::new("systemctl");
                direct.args(["restart", service]);

                vec![detached, direct]
            }
            PlatformOps::Windows => {
                let mut cmd = Command::new("cmd");
                cmd.args([
                    "/C", "sc", "stop", service, "&&", "timeout", "/t", "2", "&&", "sc", "start",
                    service,
                ]);
                vec![cmd]
            }
            PlatformOps::Darwin | PlatformOps::Unsupported => Vec::new(),
        }
    }
}

/// Asks the service supervisor to relaunch the agent.
///
/// Implementations only issue the request; they never wait for the
/// restart itself, because the restart stops this process.
pub trait ProcessRestarter: Send + Sync {
    fn request_restart(&self) -> Result<(), RestartError>;
}

/// Restarter that spawns the platform's service-control commands
pub struct ServiceRestarter {
    platform: PlatformOps,
    service: String,
}

impl ServiceRestarter {
    pub fn new(platform: PlatformOps, service: &str) -> Self {
        Self {
            platform,
            service: service.to_string(),
        }
    }
}

impl ProcessRestarter for ServiceRestarter {
    fn request_restart(&self) -> Result<(), RestartError> {
        let commands = self.platform.restart_commands(&self.service);
        if commands.is_empty() {
            warn!(
                platform = ?self.platform,
                "Automatic restart not supported on this platform, restart the agent manually"
            );
            return Ok(());
        }

        let mut last_error = None;
        for mut cmd in commands {
            let program = cmd.get_program().to_string_lossy().to_string();
            match cmd.spawn() {
                Ok(_) => {
                    info!(program = %program, service = %self.service, "Restart requested");
                    return Ok(());
                }
                Err(e) => {
                    warn!(program = %program, error = %e, "Failed to spawn restart command");
                    last_error = Some(format!("{}: {}", program, e));
                }
            }
        }

        Err(RestartError::Spawn(last_error.unwrap_or_default()))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RestartError {
    #[error("Failed to spawn restart command: {0}")]
    Spawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(
            PlatformOps::Linux.artifact_name("telemetry-agent", "x86_64"),
            "telemetry-agent-linux-amd64"
        );
        assert_eq!(
            PlatformOps::Darwin.artifact_name("telemetry-agent", "aarch64"),
            "telemetry-agent-darwin-arm64"
        );
        assert_eq!(
            PlatformOps::Windows.artifact_name("telemetry-agent", "x86"),
            "telemetry-agent-windows-386.exe"
        );
        assert_eq!(
            PlatformOps::Linux.artifact_name("telemetry-agent", "riscv64"),
            "telemetry-agent-linux-riscv64"
        );
    }

    #[test]
    fn test_linux_restart_is_detached_first() {
        let commands = PlatformOps::Linux.restart_commands("telemetry-agent");
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].get_program(), "systemd-run");
        assert_eq!(
            args(&commands[0]),
            ["--no-block", "systemctl", "restart", "telemetry-agent"]
        );
        assert_eq!(commands[1].get_program(), "systemctl");
        assert_eq!(args(&commands[1]), ["restart", "telemetry-agent"]);
    }

    #[test]
    fn test_windows_restart_uses_service_control() {
        let commands = PlatformOps::Windows.restart_commands("telemetry-agent");
        assert_eq!(commands.len(), 1);
        let joined = args(&commands[0]).join(" ");
        assert!(joined.contains("sc stop telemetry-agent"));
        assert!(joined.contains("sc start telemetry-agent"));
    }

    #[test]
    fn test_other_platforms_are_noop() {
        assert!(PlatformOps::Darwin.restart_commands("x").is_empty());
        assert!(PlatformOps::Unsupported.restart_commands("x").is_empty());
        let restarter = ServiceRestarter::new(PlatformOps::Darwin, "x");
        assert!(restarter.request_restart().is_ok());
    }

    #[test]
    fn test_exec_bit_and_detection() {
        assert!(PlatformOps::Linux.needs_exec_bit());
        assert!(!PlatformOps::Windows.needs_exec_bit());
        assert_eq!(PlatformOps::from_os("freebsd"), PlatformOps::Unsupported);
        assert_eq!(PlatformOps::from_os("macos"), PlatformOps::Darwin);
    }
}
