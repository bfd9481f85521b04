//! Shared fixtures for the driver integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use daos_csi_common::config::DriverConfig;
use daos_csi_common::constants::{VOLUME_CONTEXT_POD_NAME, VOLUME_CONTEXT_POD_NAMESPACE};
use daos_csi_common::error::Result;
use daos_csi_core::fdpass::ScmRights;
use daos_csi_core::mount::Mounter;
use daos_csi_driver::csi::{NodePublishVolumeRequest, NodeUnpublishVolumeRequest};
use daos_csi_driver::driver::DaosDriver;

/// One recorded `mount` call.
#[derive(Debug, Clone)]
pub struct MountCall {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

/// Holds `mount` until the test releases it.
pub struct Gate {
    pub entered: Mutex<Sender<()>>,
    pub release: Mutex<Receiver<()>>,
}

/// In-memory mount table.
#[derive(Default)]
pub struct FakeMounter {
    pub mounted: Mutex<HashSet<PathBuf>>,
    pub calls: Mutex<Vec<MountCall>>,
    pub unmounts: Mutex<Vec<PathBuf>>,
    pub gate: Option<Gate>,
}

impl FakeMounter {
    pub fn mount_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.lock().unwrap().len()
    }
}

impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(path))
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.entered.lock().unwrap().send(()).unwrap();
            gate.release.lock().unwrap().recv().unwrap();
        }
        self.calls.lock().unwrap().push(MountCall {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            options: options.to_vec(),
        });
        let _ = self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounts.lock().unwrap().push(target.to_path_buf());
        let _ = self.mounted.lock().unwrap().remove(target);
        Ok(())
    }
}

/// A driver running unprivileged against a scratch kubelet tree.
pub struct Harness {
    pub root: tempfile::TempDir,
    pub driver: Arc<DaosDriver>,
    pub mounter: Arc<FakeMounter>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_mounter(FakeMounter::default())
    }

    pub fn with_mounter(mounter: FakeMounter) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let device = root.path().join("fuse");
        std::fs::write(&device, b"").expect("fake device");
        let config = DriverConfig {
            node_id: "node-a".into(),
            daemon_uid: nix::unistd::getuid().as_raw(),
            daemon_gid: nix::unistd::getgid().as_raw(),
            fuse_device: device,
            handoff_deadline_ms: 30_000,
            unmount_timeout_ms: 1_000,
            ..DriverConfig::default()
        };
        let mounter = Arc::new(mounter);
        let driver = DaosDriver::new(config, mounter.clone(), Arc::new(ScmRights)).expect("driver");
        Self {
            root,
            driver: Arc::new(driver),
            mounter,
        }
    }

    fn pod_volumes(&self, pod: &str) -> PathBuf {
        self.root
            .path()
            .join("var/lib/kubelet/pods")
            .join(pod)
            .join("volumes")
    }

    pub fn target(&self, pod: &str, volume: &str) -> PathBuf {
        self.pod_volumes(pod)
            .join("kubernetes.io~csi")
            .join(volume)
            .join("mount")
    }

    pub fn staging(&self, pod: &str, volume: &str) -> PathBuf {
        self.pod_volumes(pod)
            .join("kubernetes.io~empty-dir/daos-tmp/.volumes")
            .join(volume)
    }
}

pub fn publish_request(volume_id: &str, target: &Path) -> NodePublishVolumeRequest {
    NodePublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target.display().to_string(),
        volume_context: HashMap::from([
            (VOLUME_CONTEXT_POD_NAME.to_string(), "web-0".to_string()),
            (VOLUME_CONTEXT_POD_NAMESPACE.to_string(), "default".to_string()),
        ]),
        ..NodePublishVolumeRequest::default()
    }
}

pub fn unpublish_request(volume_id: &str, target: &Path) -> NodeUnpublishVolumeRequest {
    NodeUnpublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target.display().to_string(),
    }
}
