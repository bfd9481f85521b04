//! FUSE kernel handle brokering.
//!
//! The driver opens `/dev/fuse` itself and mounts with `fd=<n>` so the
//! kernel side of the mount exists before any daemon runs. The resulting
//! [`FuseHandle`] is then owned by exactly one party at a time: the broker
//! until the mount succeeds, the handoff channel afterwards.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use daos_csi_common::error::{CsiError, Result};

use crate::mount::Mounter;

/// Filesystem type passed to `mount(2)`.
pub const FUSE_FSTYPE: &str = "fuse";

/// An open connection to the FUSE kernel device.
///
/// Dropping the handle closes the descriptor.
#[derive(Debug)]
pub struct FuseHandle(OwnedFd);

impl FuseHandle {
    /// Wraps an already-open descriptor.
    #[must_use]
    pub const fn from_owned(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl AsFd for FuseHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for FuseHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Options every DAOS FUSE mount is created with.
///
/// `uid`/`gid` are the identity of the mounting process; `fd` is the
/// descriptor number of the open FUSE handle.
#[must_use]
pub fn mount_options(uid: u32, gid: u32, fd: RawFd) -> Vec<String> {
    vec![
        "allow_other".to_string(),
        "default_permissions".to_string(),
        "rw".to_string(),
        "nodev".to_string(),
        "nosuid".to_string(),
        "rootmode=40000".to_string(),
        format!("user_id={uid}"),
        format!("group_id={gid}"),
        format!("fd={fd}"),
    ]
}

/// Opens the FUSE device and binds it to mount points.
pub struct KernelHandleBroker {
    device: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl KernelHandleBroker {
    /// Creates a broker for `device` using `mounter` for the mount syscall.
    pub fn new(device: impl Into<PathBuf>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            device: device.into(),
            mounter,
        }
    }

    /// Opens the FUSE device read-write.
    ///
    /// The descriptor is close-on-exec; it reaches the daemon only through
    /// the handoff.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Mount`] if the device cannot be opened.
    pub fn open(&self) -> Result<FuseHandle> {
        tracing::debug!(device = %self.device.display(), "opening FUSE device");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| CsiError::Mount {
                operation: "open",
                target: self.device.clone(),
                message: e.to_string(),
            })?;
        let handle = FuseHandle(OwnedFd::from(file));
        tracing::info!(device = %self.device.display(), fd = handle.as_raw_fd(), "got FUSE handle");
        Ok(handle)
    }

    /// Mounts `source` at `target`, bound to `handle`.
    ///
    /// Consumes the handle and hands it back only when the mount exists,
    /// so a failed mount always closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Mount`] if the mount syscall fails.
    pub fn bind_mount(&self, handle: FuseHandle, source: &str, target: &Path) -> Result<FuseHandle> {
        let options = mount_options(current_uid(), current_gid(), handle.as_raw_fd());
        tracing::debug!(target_path = %target.display(), ?options, "mounting FUSE filesystem");
        self.mounter.mount(source, target, FUSE_FSTYPE, &options)?;
        Ok(handle)
    }

    /// Opens the device and mounts it in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if either the open or the mount fails.
    pub fn open_and_mount(&self, source: &str, target: &Path) -> Result<FuseHandle> {
        let handle = self.open()?;
        self.bind_mount(handle, source, target)
    }
}

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}
