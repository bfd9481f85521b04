//! Kernel mount table operations.
//!
//! [`Mounter`] is the seam between the node service and the kernel: the
//! production [`KernelMounter`] issues `mount(2)`/`umount2(2)` directly,
//! tests substitute an in-memory implementation.

pub mod mountinfo;

use std::path::{Path, PathBuf};

use daos_csi_common::error::Result;

/// Mount operations needed by the node service.
pub trait Mounter: Send + Sync {
    /// Returns whether `path` is currently a mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be inspected.
    fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Mounts `source` of type `fstype` at `target`.
    ///
    /// `options` uses `mount(8)` spelling; flag-like entries (`nodev`,
    /// `ro`, ...) are translated to mount flags and the remainder is
    /// passed to the filesystem as data.
    ///
    /// # Errors
    ///
    /// Returns an error if the `mount(2)` syscall fails.
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> Result<()>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `umount2(2)` syscall fails.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether [`Mounter::force_unmount`] is backed by a real forced
    /// unmount.
    fn supports_force_unmount(&self) -> bool {
        false
    }

    /// Unmounts `target`, aborting outstanding filesystem requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount fails.
    fn force_unmount(&self, target: &Path) -> Result<()> {
        self.unmount(target)
    }
}

/// [`Mounter`] backed by direct syscalls.
#[derive(Debug, Clone)]
pub struct KernelMounter {
    mountinfo: PathBuf,
}

impl KernelMounter {
    /// Creates a mounter reading the calling process's mount table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mountinfo: PathBuf::from(mountinfo::MOUNTINFO_PATH),
        }
    }
}

impl Default for KernelMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl Mounter for KernelMounter {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        mountinfo::is_listed(&self.mountinfo, path)
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
        use daos_csi_common::error::CsiError;
        use nix::mount::mount;

        let (flags, data) = split_options(options);
        mount(
            Some(source),
            target,
            Some(fstype),
            flags,
            Some(data.as_str()),
        )
        .map_err(|e| CsiError::Mount {
            operation: "mount",
            target: target.to_path_buf(),
            message: e.to_string(),
        })?;

        tracing::info!(target_path = %target.display(), fstype, source, "filesystem mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount(target, nix::mount::MntFlags::empty())
    }

    fn supports_force_unmount(&self) -> bool {
        true
    }

    fn force_unmount(&self, target: &Path) -> Result<()> {
        umount(target, nix::mount::MntFlags::MNT_FORCE)
    }
}

#[cfg(target_os = "linux")]
fn umount(target: &Path, flags: nix::mount::MntFlags) -> Result<()> {
    use daos_csi_common::error::CsiError;

    nix::mount::umount2(target, flags).map_err(|e| CsiError::Mount {
        operation: "unmount",
        target: target.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!(target_path = %target.display(), ?flags, "filesystem unmounted");
    Ok(())
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
impl Mounter for KernelMounter {
    fn is_mount_point(&self, _path: &Path) -> Result<bool> {
        Err(linux_required())
    }

    fn mount(
        &self,
        _source: &str,
        _target: &Path,
        _fstype: &str,
        _options: &[String],
    ) -> Result<()> {
        Err(linux_required())
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Err(linux_required())
    }
}

#[cfg(not(target_os = "linux"))]
fn linux_required() -> daos_csi_common::error::CsiError {
    daos_csi_common::error::CsiError::Config {
        message: "Linux required for FUSE mounts".into(),
    }
}

/// Splits `mount(8)` style options into mount flags and filesystem data.
#[cfg(target_os = "linux")]
pub fn split_options(options: &[String]) -> (nix::mount::MsFlags, String) {
    use nix::mount::MsFlags;

    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "rw" => flags.remove(MsFlags::MS_RDONLY),
            "ro" => flags.insert(MsFlags::MS_RDONLY),
            "nodev" => flags.insert(MsFlags::MS_NODEV),
            "nosuid" => flags.insert(MsFlags::MS_NOSUID),
            "noexec" => flags.insert(MsFlags::MS_NOEXEC),
            "noatime" => flags.insert(MsFlags::MS_NOATIME),
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}
