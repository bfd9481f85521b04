//! CSI node service: the idempotent publish/unpublish state machine.
//!
//! Publish mounts FUSE in this process and leaves the handle waiting in a
//! rendezvous socket for the pod's sidecar; it never waits for the
//! sidecar itself. Every operation holds the per-target lock for its
//! whole duration and fails fast with `Aborted` when another holds it.

use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use daos_csi_common::config::DriverConfig;
use daos_csi_common::constants::{VOLUME_CONTEXT_POD_NAME, VOLUME_CONTEXT_POD_NAMESPACE};
use daos_csi_common::error::{CsiError, Result};
use daos_csi_common::paths::MountTarget;
use daos_csi_common::types::{HandoffPayload, VolumeRef};
use daos_csi_core::fdpass::DescriptorChannel;
use daos_csi_core::fuse::{FuseHandle, KernelHandleBroker};
use daos_csi_core::handoff::{HandoffChannel, HandoffSessions, HandoffSettings};
use daos_csi_core::lock::{VolumeLockGuard, VolumeLocks};
use daos_csi_core::mount::Mounter;

use crate::classify::classify_sidecar_error;
use crate::csi::{
    NodeGetCapabilitiesResponse, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse,
};
use crate::driver::validate_volume_capability;

/// Mode of directories the node service creates.
const DIR_MODE: u32 = 0o750;

/// Node service of the DAOS plugin.
pub struct NodeService {
    config: Arc<DriverConfig>,
    capabilities: Vec<NodeServiceCapability>,
    mounter: Arc<dyn Mounter>,
    channel: Arc<dyn DescriptorChannel>,
    broker: KernelHandleBroker,
    handoff: HandoffSettings,
    locks: VolumeLocks,
    sessions: HandoffSessions,
}

impl NodeService {
    /// Creates the service. `mounter` performs every mount syscall and
    /// `channel` carries handles to the sidecar.
    pub fn new(
        config: Arc<DriverConfig>,
        mounter: Arc<dyn Mounter>,
        channel: Arc<dyn DescriptorChannel>,
    ) -> Self {
        Self {
            broker: KernelHandleBroker::new(config.fuse_device.clone(), Arc::clone(&mounter)),
            handoff: HandoffSettings::from(config.as_ref()),
            capabilities: Vec::new(),
            locks: VolumeLocks::new(),
            sessions: HandoffSessions::new(),
            config,
            mounter,
            channel,
        }
    }

    /// `NodeGetInfo`.
    pub fn get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            ..NodeGetInfoResponse::default()
        }
    }

    /// `NodeGetCapabilities`.
    pub fn get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: self.capabilities.clone(),
        }
    }

    /// `NodePublishVolume`.
    ///
    /// Must run inside a tokio runtime: the rendezvous session is a
    /// detached task.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: empty or non-kubelet target path, malformed
    ///   volume id, unsupported capability, or a sidecar usage error.
    /// - `Aborted`: another operation holds the target path.
    /// - `ResourceExhausted`: the previous daemon was killed.
    /// - `Internal`: any filesystem, mount, or handoff failure.
    pub async fn publish_volume(
        &self,
        request: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse> {
        let target_path = request.target_path.as_str();
        if target_path.is_empty() {
            return Err(CsiError::invalid_argument(
                "NodePublishVolume target path must be provided",
            ));
        }
        let Some(_guard) = self.locks.lock(target_path) else {
            return Err(CsiError::OperationInProgress {
                target: target_path.to_string(),
            });
        };

        if let Some(capability) = &request.volume_capability {
            validate_volume_capability(capability)?;
        }
        let volume = VolumeRef::parse(&request.volume_id)?;
        tracing::info!(
            pool = volume.pool(),
            container = volume.container(),
            pod_namespace = context_value(&request, VOLUME_CONTEXT_POD_NAMESPACE),
            pod_name = context_value(&request, VOLUME_CONTEXT_POD_NAME),
            "NodePublishVolume"
        );

        let mount_target = MountTarget::parse(target_path)?;
        let staging = mount_target.staging_path(&self.config.staging_volume);
        create_dir(&staging)?;
        tracing::debug!(staging = %staging.display(), "staging directory ready");

        self.check_sidecar_error(&staging)?;

        let target = mount_target.target_path();
        if self.mounter.is_mount_point(target)? {
            tracing::debug!(target_path, "mount already exists");
            return Ok(NodePublishVolumeResponse {});
        }

        let payload = HandoffPayload::new(mount_target.volume_name(), &volume).encode()?;
        create_dir(target)?;
        let handle = self.broker.open_and_mount(&request.volume_id, target)?;
        self.start_handoff(&staging, target, handle, payload)?;

        tracing::info!(target_path, volume = %volume, "volume published");
        Ok(NodePublishVolumeResponse {})
    }

    /// `NodeUnpublishVolume`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: empty target path.
    /// - `Aborted`: another operation holds the target path.
    /// - `Internal`: the unmount failed or timed out, or the mount point
    ///   could not be removed. After a timeout the target stays locked
    ///   until the unmount returns.
    pub async fn unpublish_volume(
        &self,
        request: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse> {
        let target_path = request.target_path.as_str();
        if target_path.is_empty() {
            return Err(CsiError::invalid_argument(
                "NodeUnpublishVolume target path must be provided",
            ));
        }
        let Some(guard) = self.locks.lock(target_path) else {
            return Err(CsiError::OperationInProgress {
                target: target_path.to_string(),
            });
        };
        let target = Path::new(target_path);

        let mounted = self.mounter.is_mount_point(target).unwrap_or_else(|e| {
            tracing::warn!(target_path, error = %e, "mount check failed, assuming mounted");
            true
        });
        let _guard = if mounted {
            self.unmount(target, guard).await?
        } else {
            guard
        };

        match std::fs::remove_dir(target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::Io {
                    path: target.to_path_buf(),
                    source: e,
                });
            }
        }

        if let Ok(mount_target) = MountTarget::parse(target_path) {
            self.end_session(&mount_target.staging_path(&self.config.staging_volume));
        }

        tracing::info!(target_path, volume_id = %request.volume_id, "volume unpublished");
        Ok(NodeUnpublishVolumeResponse {})
    }

    /// Surfaces the error a previous sidecar run left behind.
    fn check_sidecar_error(&self, staging: &Path) -> Result<()> {
        let path = staging.join(&self.config.error_file_name);
        match std::fs::read(&path) {
            Ok(content) if content.is_empty() => Ok(()),
            Ok(content) => {
                let err = classify_sidecar_error(&String::from_utf8_lossy(&content));
                tracing::warn!(error_file = %path.display(), code = %err.code(), "sidecar reported an error");
                Err(err)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::Io { path, source: e }),
        }
    }

    /// Binds the rendezvous socket and hands `handle` to a session.
    ///
    /// On failure the handle is closed and the fresh mount is removed so
    /// the next publish starts clean.
    fn start_handoff(
        &self,
        staging: &Path,
        target: &Path,
        handle: FuseHandle,
        payload: Vec<u8>,
    ) -> Result<()> {
        let channel = match HandoffChannel::bind(staging, &self.handoff) {
            Ok(channel) => channel,
            Err(e) => {
                drop(handle);
                if let Err(unmount_err) = self.mounter.unmount(target) {
                    tracing::error!(target_path = %target.display(), error = %unmount_err, "failed to roll back mount");
                }
                return Err(e);
            }
        };
        let task = channel.spawn(handle, payload, Arc::clone(&self.channel));
        self.sessions.insert(staging.to_path_buf(), task);
        Ok(())
    }

    /// Unmounts within the configured bound, forcing when supported.
    ///
    /// The guard travels with the blocking unmount and comes back once it
    /// returns. When the bound elapses first, the guard stays with the
    /// still-running unmount, so the target remains locked until it ends.
    async fn unmount(&self, target: &Path, guard: VolumeLockGuard) -> Result<VolumeLockGuard> {
        let timeout = self.config.unmount_timeout();
        let mounter = Arc::clone(&self.mounter);
        let path = target.to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            let result = if mounter.supports_force_unmount() {
                mounter.force_unmount(&path)
            } else {
                mounter.unmount(&path)
            };
            (result, guard)
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok((Ok(()), guard))) => Ok(guard),
            Ok(Ok((Err(e), _guard))) => Err(e),
            Ok(Err(e)) => Err(unmount_error(target, e.to_string())),
            Err(_) => {
                tracing::warn!(
                    target_path = %target.display(),
                    ?timeout,
                    "unmount still running, target stays locked until it returns"
                );
                Err(unmount_error(target, format!("timed out after {timeout:?}")))
            }
        }
    }

    /// Stops the rendezvous of a torn-down mount and clears its socket.
    fn end_session(&self, staging: &Path) {
        let _ = self.sessions.cancel(staging);
        let socket = staging.join(&self.config.socket_name);
        match std::fs::remove_file(&socket) {
            Ok(()) => tracing::debug!(socket = %socket.display(), "removed rendezvous socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %socket.display(), error = %e, "failed to remove rendezvous socket"),
        }
    }
}

fn context_value<'a>(request: &'a NodePublishVolumeRequest, key: &str) -> &'a str {
    request
        .volume_context
        .get(key)
        .map_or("", String::as_str)
}

fn create_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| CsiError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

fn unmount_error(target: &Path, message: String) -> CsiError {
    CsiError::Mount {
        operation: "unmount",
        target: PathBuf::from(target),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use daos_csi_common::error::Code;
    use daos_csi_core::fdpass::ScmRights;

    use super::*;

    #[derive(Default)]
    struct FakeMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
        broken_table: bool,
        unmount_delay: Option<Duration>,
        unmount_fails: bool,
    }

    impl Mounter for FakeMounter {
        fn is_mount_point(&self, path: &Path) -> Result<bool> {
            if self.broken_table {
                return Err(CsiError::Config {
                    message: "mountinfo unreadable".into(),
                });
            }
            Ok(self.mounted.lock().unwrap().contains(path))
        }

        fn mount(&self, _source: &str, target: &Path, _fstype: &str, _options: &[String]) -> Result<()> {
            let _ = self.mounts.fetch_add(1, Ordering::SeqCst);
            let _ = self.mounted.lock().unwrap().insert(target.to_path_buf());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            let _ = self.unmounts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.unmount_delay {
                std::thread::sleep(delay);
            }
            if self.unmount_fails {
                return Err(unmount_error(target, "device or resource busy".into()));
            }
            let _ = self.mounted.lock().unwrap().remove(target);
            Ok(())
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        node: NodeService,
        mounter: Arc<FakeMounter>,
        target: PathBuf,
        staging: PathBuf,
    }

    fn fixture(mounter: FakeMounter) -> Fixture {
        fixture_with_timeout(mounter, 5_000)
    }

    fn fixture_with_timeout(mounter: FakeMounter, unmount_timeout_ms: u64) -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let device = root.path().join("fuse");
        std::fs::write(&device, b"").expect("device");
        let config = DriverConfig {
            node_id: "node-a".into(),
            daemon_uid: nix::unistd::getuid().as_raw(),
            daemon_gid: nix::unistd::getgid().as_raw(),
            fuse_device: device,
            handoff_deadline_ms: 60_000,
            unmount_timeout_ms,
            ..DriverConfig::default()
        };
        let pod = root.path().join("pods/p1/volumes");
        let target = pod.join("kubernetes.io~csi/v1/mount");
        let staging = pod.join("kubernetes.io~empty-dir/daos-tmp/.volumes/v1");
        let mounter = Arc::new(mounter);
        let node = NodeService::new(Arc::new(config), mounter.clone(), Arc::new(ScmRights));
        Fixture {
            _root: root,
            node,
            mounter,
            target,
            staging,
        }
    }

    fn publish_request(target: &Path) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "poolA/containerB".into(),
            target_path: target.display().to_string(),
            volume_context: HashMap::from([
                (VOLUME_CONTEXT_POD_NAME.to_string(), "web-0".to_string()),
                (VOLUME_CONTEXT_POD_NAMESPACE.to_string(), "default".to_string()),
            ]),
            ..NodePublishVolumeRequest::default()
        }
    }

    fn unpublish_request(target: &Path) -> NodeUnpublishVolumeRequest {
        NodeUnpublishVolumeRequest {
            volume_id: "poolA/containerB".into(),
            target_path: target.display().to_string(),
        }
    }

    #[test]
    fn info_and_capabilities() {
        let f = fixture(FakeMounter::default());
        assert_eq!(f.node.get_info().node_id, "node-a");
        assert!(f.node.get_capabilities().capabilities.is_empty());
    }

    #[tokio::test]
    async fn publish_mounts_and_opens_rendezvous() {
        let f = fixture(FakeMounter::default());
        let _ = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .expect("publish");

        assert_eq!(f.mounter.mounts.load(Ordering::SeqCst), 1);
        assert!(f.target.is_dir());
        assert!(f.staging.join("socket").exists());
        assert!(f.node.sessions.is_active(&f.staging));
        assert!(!f.node.locks.is_held(&f.target.display().to_string()));
    }

    #[tokio::test]
    async fn empty_target_is_invalid() {
        let f = fixture(FakeMounter::default());
        let err = f
            .node
            .publish_volume(NodePublishVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = f
            .node
            .unpublish_volume(NodeUnpublishVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn held_lock_aborts() {
        let f = fixture(FakeMounter::default());
        let key = f.target.display().to_string();
        let _guard = f.node.locks.lock(&key).expect("lock");

        let err = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        let err = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(f.mounter.mounts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_inputs_release_lock_without_mounting() {
        let f = fixture(FakeMounter::default());

        let mut bad_volume = publish_request(&f.target);
        bad_volume.volume_id = "poolA".into();
        let err = f.node.publish_volume(bad_volume).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut bad_target = publish_request(&f.target);
        bad_target.target_path = "/srv/volumes/v1/mount".into();
        let err = f.node.publish_volume(bad_target).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        assert_eq!(f.mounter.mounts.load(Ordering::SeqCst), 0);
        assert!(f.node.locks.lock(&f.target.display().to_string()).is_some());
    }

    #[tokio::test]
    async fn killed_sidecar_is_resource_exhausted() {
        let f = fixture(FakeMounter::default());
        std::fs::create_dir_all(&f.staging).expect("staging");
        std::fs::write(f.staging.join("error"), "dfuse: signal: killed\n").expect("error file");

        let err = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(f.mounter.mounts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_error_file_is_ignored() {
        let f = fixture(FakeMounter::default());
        std::fs::create_dir_all(&f.staging).expect("staging");
        std::fs::write(f.staging.join("error"), "").expect("error file");

        let _ = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .expect("publish");
        assert_eq!(f.mounter.mounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_capability_is_rejected() {
        use crate::csi::VolumeCapability;
        use crate::csi::volume_capability::access_mode::Mode;
        use crate::csi::volume_capability::{AccessMode, AccessType, MountVolume};

        let f = fixture(FakeMounter::default());
        let mut request = publish_request(&f.target);
        request.volume_capability = Some(VolumeCapability {
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeSingleWriter.into(),
            }),
            access_type: Some(AccessType::Mount(MountVolume::default())),
        });
        let err = f.node.publish_volume(request).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unpublish_unmounts_and_cancels_session() {
        let f = fixture(FakeMounter::default());
        let _ = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .expect("publish");

        let _ = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .expect("unpublish");
        assert_eq!(f.mounter.unmounts.load(Ordering::SeqCst), 1);
        assert!(!f.target.exists());
        assert!(!f.staging.join("socket").exists());
        assert!(!f.node.sessions.is_active(&f.staging));
    }

    #[tokio::test]
    async fn unreadable_mount_table_assumes_mounted() {
        let f = fixture(FakeMounter {
            broken_table: true,
            ..FakeMounter::default()
        });
        let _ = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .expect("unpublish");
        assert_eq!(f.mounter.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unpublish_fresh_target_skips_unmount() {
        let f = fixture(FakeMounter::default());
        let _ = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .expect("unpublish");
        assert_eq!(f.mounter.unmounts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unmount_timeout_is_internal_and_keeps_target_locked() {
        let f = fixture_with_timeout(
            FakeMounter {
                broken_table: true,
                unmount_delay: Some(Duration::from_millis(400)),
                ..FakeMounter::default()
            },
            50,
        );
        let key = f.target.display().to_string();

        let err = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("timed out"));
        assert!(f.node.locks.is_held(&key));
        let err = f
            .node
            .publish_volume(publish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!f.node.locks.is_held(&key));
    }

    #[tokio::test]
    async fn failed_unmount_is_internal_and_releases_lock() {
        let f = fixture(FakeMounter {
            broken_table: true,
            unmount_fails: true,
            ..FakeMounter::default()
        });

        let err = f
            .node
            .unpublish_volume(unpublish_request(&f.target))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("busy"));
        assert_eq!(f.mounter.unmounts.load(Ordering::SeqCst), 1);
        assert!(!f.node.locks.is_held(&f.target.display().to_string()));
    }

    #[tokio::test]
    async fn trailing_slash_names_the_same_target() {
        let f = fixture(FakeMounter::default());
        let _guard = f
            .node
            .locks
            .lock(&f.target.display().to_string())
            .expect("lock");

        let mut request = publish_request(&f.target);
        request.target_path.push('/');
        let err = f.node.publish_volume(request).await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
    }
}
