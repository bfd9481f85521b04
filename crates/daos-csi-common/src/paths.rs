//! Kubelet path conventions.
//!
//! A CSI target path looks like
//! `<root>/pods/<podUID>/volumes/kubernetes.io~csi/<volume>/mount`. The
//! sidecar shares an emptyDir with the driver whose host path is the same
//! pod directory with the plugin tail swapped for
//! `kubernetes.io~empty-dir/<stagingVolume>/.volumes/<volume>`.

use std::path::{Component, Path, PathBuf};

use crate::constants::{CSI_PLUGIN_MARKER, EMPTY_DIR_MARKER, VOLUMES_DIR};
use crate::error::{CsiError, Result};

/// A target path that matched the kubelet layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    owner_id: String,
    volume_name: String,
    target_path: PathBuf,
}

impl MountTarget {
    /// Matches `target_path` against the kubelet layout.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::InvalidTargetPath`] when the path is relative,
    /// contains `..`, is not valid UTF-8, or does not end in
    /// `pods/<id>/volumes/kubernetes.io~csi/<volume>/mount`.
    pub fn parse(target_path: &str) -> Result<Self> {
        let invalid = |reason| CsiError::InvalidTargetPath {
            path: target_path.to_string(),
            reason,
        };

        let path = Path::new(target_path);
        if !path.is_absolute() {
            return Err(invalid("path is not absolute"));
        }

        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(s) => {
                    segments.push(s.to_str().ok_or_else(|| invalid("path is not UTF-8"))?);
                }
                Component::CurDir | Component::ParentDir | Component::Prefix(_) => {
                    return Err(invalid("path is not normalized"));
                }
            }
        }

        let [.., pods, owner, volumes, marker, volume, mount] = segments.as_slice() else {
            return Err(invalid("path is too short"));
        };
        if *pods != "pods" || *volumes != "volumes" {
            return Err(invalid("missing pods/<id>/volumes"));
        }
        if *marker != CSI_PLUGIN_MARKER {
            return Err(invalid("not a CSI volume path"));
        }
        if *mount != "mount" {
            return Err(invalid("path does not end in mount"));
        }

        Ok(Self {
            owner_id: (*owner).to_string(),
            volume_name: (*volume).to_string(),
            target_path: path.to_path_buf(),
        })
    }

    /// Pod UID owning the volume.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Kubernetes volume name.
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// The target path as given by the orchestrator.
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Host path of this volume's directory in the sidecar's emptyDir.
    #[must_use]
    pub fn staging_path(&self, staging_volume: &str) -> PathBuf {
        // <volume>/mount -> <volume> -> kubernetes.io~csi -> volumes
        let volumes_dir = self
            .target_path
            .ancestors()
            .nth(3)
            .unwrap_or(&self.target_path);
        volumes_dir
            .join(EMPTY_DIR_MARKER)
            .join(staging_volume)
            .join(VOLUMES_DIR)
            .join(&self.volume_name)
    }
}
