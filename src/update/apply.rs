//! Atomic executable replacement with rollback
//!
//! The swap works on three co-located paths:
//!
//!   /usr/local/bin/telemetry-agent          # running binary
//!   /usr/local/bin/telemetry-agent.new      # downloaded replacement
//!   /usr/local/bin/telemetry-agent.backup   # previous binary during the swap
//!
//! All three must live on the same filesystem so each rename is atomic.
//! The sequence is: chmod `.new`, rename current to `.backup`, rename
//! `.new` to current, remove `.backup`. If the second rename fails the
//! backup is renamed back. If that also fails there is no binary at the
//! current path and the swap ends in [`UpdateError::CorruptedInstall`].

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::UpdateError;

/// The path triple used by one self-replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSwap {
    current: PathBuf,
    temp: PathBuf,
    backup: PathBuf,
}

/// What [`ExecutableSwap::recover`] did at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing left over from a previous update
    Clean,
    /// Leftover `.new` / `.backup` files were removed
    Cleaned,
    /// The current binary was missing and was restored from `.backup`
    Restored,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl ExecutableSwap {
    pub fn for_executable(current: impl Into<PathBuf>) -> Self {
        let current = current.into();
        Self {
            temp: with_suffix(&current, ".new"),
            backup: with_suffix(&current, ".backup"),
            current,
        }
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    pub fn backup(&self) -> &Path {
        &self.backup
    }

    /// Remove the downloaded replacement, if any
    pub fn discard_temp(&self) {
        if self.temp.exists() {
            if let Err(e) = fs::remove_file(&self.temp) {
                warn!(path = %self.temp.display(), error = %e, "Failed to remove downloaded update");
            }
        }
    }

    /// Mark the downloaded replacement executable (0755)
    pub fn make_executable(&self) -> Result<(), UpdateError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let result = fs::metadata(&self.temp).and_then(|meta| {
                let mut perms = meta.permissions();
                perms.set_mode(0o755);
                fs::set_permissions(&self.temp, perms)
            });
            if let Err(e) = result {
                self.discard_temp();
                return Err(UpdateError::Permission(e.to_string()));
            }
        }
        Ok(())
    }

    /// Swap the replacement in: backup, install, drop the backup
    pub fn commit(&self) -> Result<(), UpdateError> {
        self.move_current_to_backup()?;
        self.install()
    }

    /// Rename current → backup. The replacement is discarded on failure.
    pub(crate) fn move_current_to_backup(&self) -> Result<(), UpdateError> {
        info!(
            current = %self.current.display(),
            backup = %self.backup.display(),
            "Backing up current executable"
        );
        if let Err(e) = fs::rename(&self.current, &self.backup) {
            self.discard_temp();
            return Err(UpdateError::BackupFailed(e.to_string()));
        }
        Ok(())
    }

    /// Rename temp → current, rolling back from the backup on failure
    pub(crate) fn install(&self) -> Result<(), UpdateError> {
        match fs::rename(&self.temp, &self.current) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&self.backup) {
                    warn!(path = %self.backup.display(), error = %e, "Failed to remove backup");
                }
                info!(path = %self.current.display(), "New executable installed");
                Ok(())
            }
            Err(install_err) => {
                error!(error = %install_err, "Failed to install new executable, restoring backup");
                match fs::rename(&self.backup, &self.current) {
                    Ok(()) => {
                        self.discard_temp();
                        Err(UpdateError::InstallFailed(install_err.to_string()))
                    }
                    Err(rollback_err) => {
                        error!(
                            path = %self.current.display(),
                            backup = %self.backup.display(),
                            error = %rollback_err,
                            "Rollback failed, no executable at the install path"
                        );
                        Err(UpdateError::CorruptedInstall {
                            install: install_err.to_string(),
                            rollback: rollback_err.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Heal whatever an interrupted update left behind.
    ///
    /// Called at startup, before the first connection.
    pub fn recover(&self) -> Result<Recovery, UpdateError> {
        if !self.current.exists() && self.backup.exists() {
            warn!(backup = %self.backup.display(), "Executable missing, restoring backup");
            fs::rename(&self.backup, &self.current)
                .map_err(|e| UpdateError::Io(format!("restore backup: {}", e)))?;
            self.discard_temp();
            return Ok(Recovery::Restored);
        }

        let mut cleaned = false;
        for leftover in [&self.temp, &self.backup] {
            if leftover.exists() {
                info!(path = %leftover.display(), "Removing leftover update file");
                fs::remove_file(leftover)
                    .map_err(|e| UpdateError::Io(format!("remove {}: {}", leftover.display(), e)))?;
                cleaned = true;
            }
        }

        Ok(if cleaned { Recovery::Cleaned } else { Recovery::Clean })
    }
}
