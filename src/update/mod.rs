//! Self-update
//!
//! Triggered by an `update` command from the collector:
//! 1. Resolve the artifact URL (explicit URL, or latest release for this platform)
//! 2. Skip if already on the latest version, unless forced
//! 3. Download next to the running executable
//! 4. Swap it in atomically, rolling back on failure
//! 5. Ask the supervisor to restart the service
//!
//! Every failure before step 5 leaves the running binary untouched and the
//! agent keeps streaming.

pub mod apply;
pub mod download;
pub mod release;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::platform::{PlatformOps, ProcessRestarter};
use crate::protocol::UpdateCommand;

pub use apply::{ExecutableSwap, Recovery};
pub use download::Artifact;
pub use release::{HttpReleaseSource, ReleaseSource};

/// Current version of this binary
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where an update would come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Latest release matches the running version
    UpToDate { version: String },
    /// Download from `url`; `latest` is the resolved tag when one was queried
    Download { url: String, latest: Option<String> },
}

/// Result of a completed update run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to do
    UpToDate { version: String },
    /// New binary installed and a restart requested; the process should exit
    RestartRequested { artifact: Artifact },
}

/// Anything that can act on an `update` command
#[async_trait::async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, command: &UpdateCommand) -> Result<UpdateOutcome, UpdateError>;
}

/// Downloads and installs new agent binaries in place
pub struct SelfUpdater {
    executable: PathBuf,
    current_version: String,
    binary_name: String,
    platform: PlatformOps,
    source: Arc<dyn ReleaseSource>,
    restarter: Arc<dyn ProcessRestarter>,
    restart_grace: Duration,
}

impl SelfUpdater {
    pub fn new(
        executable: PathBuf,
        binary_name: &str,
        platform: PlatformOps,
        source: Arc<dyn ReleaseSource>,
        restarter: Arc<dyn ProcessRestarter>,
    ) -> Self {
        Self {
            executable,
            current_version: CURRENT_VERSION.to_string(),
            binary_name: binary_name.to_string(),
            platform,
            source,
            restarter,
            restart_grace: Duration::from_millis(500),
        }
    }

    /// Override the version compared against the latest release
    pub fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = version.to_string();
        self
    }

    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Platform artifact this agent would download
    pub fn artifact_name(&self) -> String {
        self.platform
            .artifact_name(&self.binary_name, std::env::consts::ARCH)
    }

    /// Decide where the update comes from, or that none is needed.
    ///
    /// An explicit URL is used verbatim and skips the version check
    /// entirely, `force` included. A failed release query does not abort:
    /// the `latest` tag is used instead.
    pub async fn resolve(&self, command: &UpdateCommand) -> Resolution {
        if let Some(url) = command.download_url.as_deref().filter(|u| !u.is_empty()) {
            info!(url = %url, "Using provided download URL");
            return Resolution::Download {
                url: url.to_string(),
                latest: None,
            };
        }

        let artifact = self.artifact_name();
        let tag = match self.source.latest_tag().await {
            Ok(tag) => {
                if !command.force && same_version(&tag, &self.current_version) {
                    return Resolution::UpToDate {
                        version: self.current_version.clone(),
                    };
                }
                info!(current = %self.current_version, latest = %tag, "Update available");
                Some(tag)
            }
            Err(e) => {
                warn!(error = %e, "Could not query latest release, falling back to 'latest'");
                None
            }
        };

        let url = self
            .source
            .artifact_url(tag.as_deref().unwrap_or("latest"), &artifact);
        Resolution::Download { url, latest: tag }
    }

    /// Run the full update sequence
    pub async fn run(&self, command: &UpdateCommand) -> Result<UpdateOutcome, UpdateError> {
        if command.force {
            info!(current = %self.current_version, "Starting forced self-update");
        } else {
            info!(current = %self.current_version, "Starting self-update");
        }

        let url = match self.resolve(command).await {
            Resolution::UpToDate { version } => {
                info!(version = %version, "Already on latest version, skipping update");
                return Ok(UpdateOutcome::UpToDate { version });
            }
            Resolution::Download { url, .. } => url,
        };

        let swap = ExecutableSwap::for_executable(&self.executable);

        let artifact = self.source.download(&url, swap.temp()).await?;

        if self.platform.needs_exec_bit() {
            swap.make_executable()?;
        }

        swap.commit()?;

        info!(sha256 = %artifact.sha256, "Update installed, restarting");
        if let Err(e) = self.restarter.request_restart() {
            // The new binary is in place; the supervisor relaunches it once we exit
            error!(error = %e, "Restart request failed");
        }

        tokio::time::sleep(self.restart_grace).await;

        Ok(UpdateOutcome::RestartRequested { artifact })
    }
}

#[async_trait::async_trait]
impl UpdateHandler for SelfUpdater {
    async fn handle_update(&self, command: &UpdateCommand) -> Result<UpdateOutcome, UpdateError> {
        self.run(command).await
    }
}

/// Strip one leading `v` so tags and crate versions compare equal
pub fn normalize_version(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

fn same_version(a: &str, b: &str) -> bool {
    normalize_version(a) == normalize_version(b)
}

/// Update errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid release metadata: {0}")]
    InvalidRelease(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Failed to set permissions: {0}")]
    Permission(String),

    #[error("Failed to back up current executable: {0}")]
    BackupFailed(String),

    #[error("Failed to install new executable (original restored): {0}")]
    InstallFailed(String),

    #[error("Install failed ({install}) and rollback failed ({rollback}); no executable in place")]
    CorruptedInstall { install: String, rollback: String },

    #[error("IO error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RestartError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeSource {
        tag: Result<String, UpdateError>,
        body: Result<Vec<u8>, UpdateError>,
        downloads: AtomicUsize,
        last_url: std::sync::Mutex<Option<String>>,
    }

    impl FakeSource {
        fn new(tag: Result<&str, UpdateError>, body: Result<&[u8], UpdateError>) -> Self {
            Self {
                tag: tag.map(str::to_string),
                body: body.map(<[u8]>::to_vec),
                downloads: AtomicUsize::new(0),
                last_url: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl ReleaseSource for FakeSource {
        async fn latest_tag(&self) -> Result<String, UpdateError> {
            self.tag.clone()
        }

        fn artifact_url(&self, tag: &str, artifact: &str) -> String {
            format!("https://releases.test/{}/{}", tag, artifact)
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<Artifact, UpdateError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            *self.last_url.lock().unwrap() = Some(url.to_string());
            let body = self.body.clone()?;
            std::fs::write(dest, &body).unwrap();
            Ok(Artifact {
                size_bytes: body.len() as u64,
                sha256: "fake".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct FakeRestarter {
        calls: AtomicUsize,
    }

    impl ProcessRestarter for FakeRestarter {
        fn request_restart(&self) -> Result<(), RestartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn updater(
        dir: &TempDir,
        source: Arc<FakeSource>,
        restarter: Arc<FakeRestarter>,
    ) -> SelfUpdater {
        let exe = dir.path().join("telemetry-agent");
        std::fs::write(&exe, b"old").unwrap();
        SelfUpdater::new(exe, "telemetry-agent", PlatformOps::Linux, source, restarter)
            .with_current_version("1.2.0")
            .with_restart_grace(Duration::from_millis(1))
    }

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("v1.2.0"), "1.2.0");
        assert_eq!(normalize_version("1.2.0"), "1.2.0");
        assert!(same_version("v1.2.0", "1.2.0"));
        assert!(!same_version("v1.3.0", "1.2.0"));
    }

    #[tokio::test]
    async fn test_up_to_date_skips_download() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(Ok("v1.2.0"), Ok(b"new")));
        let restarter = Arc::new(FakeRestarter::default());
        let updater = updater(&dir, source.clone(), restarter.clone());

        let outcome = updater.run(&UpdateCommand::default()).await.unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::UpToDate {
                version: "1.2.0".to_string()
            }
        );
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(restarter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(dir.path().join("telemetry-agent")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_force_updates_same_version() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(Ok("v1.2.0"), Ok(b"new")));
        let restarter = Arc::new(FakeRestarter::default());
        let updater = updater(&dir, source.clone(), restarter.clone());

        let outcome = updater
            .run(&UpdateCommand {
                download_url: None,
                force: true,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, UpdateOutcome::RestartRequested { .. }));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(restarter.calls.load(Ordering::SeqCst), 1);

        let exe = dir.path().join("telemetry-agent");
        assert_eq!(std::fs::read(&exe).unwrap(), b"new");
        assert!(!dir.path().join("telemetry-agent.backup").exists());
        assert!(!dir.path().join("telemetry-agent.new").exists());

        let url = source.last_url.lock().unwrap().clone().unwrap();
        assert!(url.starts_with("https://releases.test/v1.2.0/telemetry-agent-linux-"));
    }

    #[tokio::test]
    async fn test_explicit_url_bypasses_version_check() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(Ok("v1.2.0"), Ok(b"new")));
        let restarter = Arc::new(FakeRestarter::default());
        let updater = updater(&dir, source.clone(), restarter.clone());

        let command = UpdateCommand {
            download_url: Some("https://mirror.test/agent".to_string()),
            force: false,
        };
        let outcome = updater.run(&command).await.unwrap();

        assert!(matches!(outcome, UpdateOutcome::RestartRequested { .. }));
        assert_eq!(
            source.last_url.lock().unwrap().as_deref(),
            Some("https://mirror.test/agent")
        );
    }

    #[tokio::test]
    async fn test_failed_release_query_falls_back_to_latest() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(
            Err(UpdateError::Network("offline".to_string())),
            Ok(b"new"),
        ));
        let updater = updater(&dir, source, Arc::new(FakeRestarter::default()));

        match updater.resolve(&UpdateCommand::default()).await {
            Resolution::Download { url, latest } => {
                assert!(url.starts_with("https://releases.test/latest/"));
                assert!(latest.is_none());
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_failure_leaves_binary_untouched() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(
            Ok("v2.0.0"),
            Err(UpdateError::DownloadFailed("HTTP 404 Not Found".to_string())),
        ));
        let restarter = Arc::new(FakeRestarter::default());
        let updater = updater(&dir, source, restarter.clone());

        let err = updater.run(&UpdateCommand::default()).await.unwrap_err();

        assert!(matches!(err, UpdateError::DownloadFailed(_)));
        assert_eq!(std::fs::read(dir.path().join("telemetry-agent")).unwrap(), b"old");
        assert!(!dir.path().join("telemetry-agent.backup").exists());
        assert!(!dir.path().join("telemetry-agent.new").exists());
        assert_eq!(restarter.calls.load(Ordering::SeqCst), 0);
    }
}
