//! Configuration model for the DAOS CSI driver.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CsiError, Result};

/// Root configuration shared by the node service and the handoff channel.
///
/// Every identity and marker name the driver relies on lives here rather
/// than in globals so tests can run unprivileged against scratch
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverConfig {
    /// Driver name reported to the orchestrator.
    pub name: String,
    /// Driver version reported to the orchestrator.
    pub version: String,
    /// Stable identity of this node.
    pub node_id: String,
    /// Uid the sidecar's filesystem daemon runs as.
    pub daemon_uid: u32,
    /// Gid the sidecar's filesystem daemon runs as.
    pub daemon_gid: u32,
    /// Name of the emptyDir volume shared with the sidecar.
    pub staging_volume: String,
    /// Relative name of the rendezvous socket.
    pub socket_name: String,
    /// Relative name of the sidecar error marker.
    pub error_file_name: String,
    /// FUSE kernel device opened for every mount.
    pub fuse_device: PathBuf,
    /// Milliseconds a rendezvous socket waits for the sidecar.
    pub handoff_deadline_ms: u64,
    /// Milliseconds a forced unmount may take.
    pub unmount_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: constants::DRIVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: String::new(),
            daemon_uid: constants::NOBODY_UID,
            daemon_gid: constants::NOBODY_GID,
            staging_volume: constants::SIDECAR_VOLUME_NAME.to_string(),
            socket_name: constants::SOCKET_FILE_NAME.to_string(),
            error_file_name: constants::ERROR_FILE_NAME.to_string(),
            fuse_device: PathBuf::from(constants::FUSE_DEVICE),
            handoff_deadline_ms: duration_ms(constants::HANDOFF_DEADLINE),
            unmount_timeout_ms: duration_ms(constants::UNMOUNT_TIMEOUT),
        }
    }
}

impl DriverConfig {
    /// Checks the fields every driver needs regardless of its role.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Config`] when the name, version, or one of the
    /// marker names is empty.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("driver name", &self.name),
            ("driver version", &self.version),
            ("staging volume", &self.staging_volume),
            ("socket name", &self.socket_name),
            ("error file name", &self.error_file_name),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(CsiError::Config {
                    message: format!("{field} missing"),
                });
            }
        }
        Ok(())
    }

    /// Deadline of a rendezvous session.
    pub const fn handoff_deadline(&self) -> Duration {
        Duration::from_millis(self.handoff_deadline_ms)
    }

    /// Bound on a forced unmount.
    pub const fn unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.unmount_timeout_ms)
    }

    /// Loads a configuration file, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| CsiError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
