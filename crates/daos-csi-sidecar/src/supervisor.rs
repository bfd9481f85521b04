//! Discovers staged volumes and keeps one daemon per volume.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use daos_csi_common::constants::{
    DAEMON_BINARY, ERROR_FILE_NAME, SIDECAR_VOLUME_MOUNT_PATH, SOCKET_FILE_NAME, VOLUMES_DIR,
};
use daos_csi_common::error::{CsiError, Result};
use daos_csi_core::fdpass::DescriptorChannel;

use crate::launcher::{self, VolumeDir, describe_exit};

/// Settings of the sidecar process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Directory holding one staging directory per volume.
    pub volume_base: PathBuf,
    /// Filesystem daemon; bare names are looked up on `PATH`.
    pub daemon_path: PathBuf,
    /// Rendezvous socket name inside each staging directory.
    pub socket_name: String,
    /// Error file name inside each staging directory.
    pub error_file_name: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            volume_base: Path::new(SIDECAR_VOLUME_MOUNT_PATH).join(VOLUMES_DIR),
            daemon_path: PathBuf::from(DAEMON_BINARY),
            socket_name: SOCKET_FILE_NAME.to_string(),
            error_file_name: ERROR_FILE_NAME.to_string(),
        }
    }
}

/// Outcome of one supervision run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Daemons that were started.
    pub launched: usize,
    /// `(volume, description)` for every launch failure or abnormal exit.
    pub failures: Vec<(String, String)>,
}

impl SupervisorReport {
    /// Whether every volume was served and every daemon exited cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the filesystem daemon for every staged volume.
pub struct Supervisor {
    config: SidecarConfig,
    daemon: PathBuf,
    channel: Arc<dyn DescriptorChannel>,
}

impl Supervisor {
    /// Creates a supervisor, resolving the daemon binary up front.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::NotFound`] when the daemon cannot be located.
    pub fn new(config: SidecarConfig, channel: Arc<dyn DescriptorChannel>) -> Result<Self> {
        let daemon = resolve_daemon(&config.daemon_path)?;
        tracing::debug!(daemon = %daemon.display(), "resolved filesystem daemon");
        Ok(Self {
            config,
            daemon,
            channel,
        })
    }

    /// Launches a daemon for each discovered volume and waits for all of
    /// them to exit.
    ///
    /// A volume that fails to launch does not stop the others; its failure
    /// is recorded in its error file and in the report.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Io`] if the volume base cannot be listed.
    pub fn run(&self) -> Result<SupervisorReport> {
        let volumes = discover_volumes(
            &self.config.volume_base,
            &self.config.socket_name,
            &self.config.error_file_name,
        )?;
        if volumes.is_empty() {
            tracing::info!(base = %self.config.volume_base.display(), "no volumes to serve");
        }

        let mut report = SupervisorReport::default();
        let mut daemons = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            match launcher::launch(volume, self.channel.as_ref(), &self.daemon) {
                Ok(daemon) => {
                    tracing::info!(volume = %volume.name(), pid = daemon.pid(), "daemon started");
                    daemons.push(daemon);
                }
                Err(e) => {
                    tracing::error!(volume = %volume.name(), error = %e, "failed to launch daemon");
                    report.failures.push((volume.name(), e.to_string()));
                }
            }
        }
        report.launched = daemons.len();

        for daemon in daemons {
            let name = daemon.volume().name();
            match daemon.wait() {
                Ok(status) => {
                    if let Some(description) = describe_exit(status) {
                        report.failures.push((name, description));
                    }
                }
                Err(e) => report.failures.push((name, e.to_string())),
            }
        }
        Ok(report)
    }
}

/// Locates the daemon binary. Absolute or relative paths must exist; bare
/// names are searched on `PATH`.
///
/// # Errors
///
/// Returns [`CsiError::NotFound`] when nothing matches.
pub fn resolve_daemon(path: &Path) -> Result<PathBuf> {
    if path.components().count() > 1 || path.is_absolute() {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(CsiError::NotFound {
            kind: "daemon binary",
            id: path.display().to_string(),
        });
    }
    which::which(path).map_err(|_| CsiError::NotFound {
        kind: "daemon binary",
        id: format!("{} (not on PATH)", path.display()),
    })
}

/// Lists the staging directories under `base` that hold a rendezvous
/// socket, sorted by name.
///
/// # Errors
///
/// Returns [`CsiError::Io`] if `base` cannot be read.
pub fn discover_volumes(
    base: &Path,
    socket_name: &str,
    error_file_name: &str,
) -> Result<Vec<VolumeDir>> {
    let entries = std::fs::read_dir(base).map_err(|e| CsiError::Io {
        path: base.to_path_buf(),
        source: e,
    })?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir() && path.join(socket_name).exists())
        .collect();
    dirs.sort();
    Ok(dirs
        .into_iter()
        .map(|dir| VolumeDir::new(dir, socket_name, error_file_name))
        .collect())
}
