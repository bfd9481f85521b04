//! Well-known names, identities, and kubelet path markers.

use std::time::Duration;

/// Driver name reported by `GetPluginInfo`.
pub const DRIVER_NAME: &str = "daos.csi.storage.gke.io";

/// Default CSI endpoint.
pub const DEFAULT_ENDPOINT: &str = "unix:/tmp/csi.sock";

/// Name of the emptyDir volume shared between the driver and the sidecar.
pub const SIDECAR_VOLUME_NAME: &str = "daos-tmp";

/// Mount path of the shared emptyDir inside the sidecar container.
pub const SIDECAR_VOLUME_MOUNT_PATH: &str = "/daos-tmp";

/// Directory under the shared emptyDir that holds one entry per volume.
pub const VOLUMES_DIR: &str = ".volumes";

/// Unprivileged identity the filesystem daemon runs as (`nobody`).
pub const NOBODY_UID: u32 = 65534;

/// Group of the unprivileged daemon identity.
pub const NOBODY_GID: u32 = 65534;

/// Relative name of the rendezvous socket inside a staging directory.
pub const SOCKET_FILE_NAME: &str = "socket";

/// Name of the error marker the sidecar writes inside a staging directory.
pub const ERROR_FILE_NAME: &str = "error";

/// Kubelet path segment owned by CSI plugins.
pub const CSI_PLUGIN_MARKER: &str = "kubernetes.io~csi";

/// Kubelet path segment owned by emptyDir volumes.
pub const EMPTY_DIR_MARKER: &str = "kubernetes.io~empty-dir";

/// Raw FUSE kernel device.
pub const FUSE_DEVICE: &str = "/dev/fuse";

/// Filesystem daemon executed by the sidecar.
pub const DAEMON_BINARY: &str = "dfuse";

/// Descriptor number the daemon finds the FUSE handle at.
pub const DAEMON_FUSE_FD: i32 = 3;

/// How long a rendezvous socket waits for the sidecar.
pub const HANDOFF_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Upper bound for a forced unmount.
pub const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Volume context key carrying the workload pod name.
pub const VOLUME_CONTEXT_POD_NAME: &str = "csi.storage.k8s.io/pod.name";

/// Volume context key carrying the workload pod namespace.
pub const VOLUME_CONTEXT_POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
