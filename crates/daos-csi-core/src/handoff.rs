//! The FUSE handle rendezvous between the driver and the sidecar.
//!
//! A [`HandoffChannel`] is a Unix socket in the pod's staging directory,
//! owned by the daemon identity. Once spawned it accepts a single
//! connection, sends the payload with the FUSE handle attached, and tears
//! down. A session that nobody connects to within the deadline, or whose
//! task is aborted through [`HandoffSessions`], releases the same
//! resources: the listener, the socket file, and the handle.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use daos_csi_common::config::DriverConfig;
use daos_csi_common::error::{CsiError, Result};
use tokio::task::JoinHandle;

use crate::fdpass::DescriptorChannel;
use crate::fuse::FuseHandle;
use crate::workdir;

/// Capacity of `sockaddr_un.sun_path`, including the trailing NUL.
#[cfg(target_os = "linux")]
const SUN_PATH_MAX: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_MAX: usize = 104;

/// How a rendezvous session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// A peer connected and received the handle.
    Delivered,
    /// The deadline elapsed without a connection.
    Expired,
    /// Accepting or sending failed.
    Failed(String),
}

/// Identity and timing of a rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSettings {
    /// Owner given to the staging tree and socket.
    pub daemon_uid: u32,
    /// Group given to the staging tree and socket.
    pub daemon_gid: u32,
    /// Socket file name inside the staging directory.
    pub socket_name: String,
    /// How long to wait for the sidecar.
    pub deadline: Duration,
}

impl From<&DriverConfig> for HandoffSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            daemon_uid: config.daemon_uid,
            daemon_gid: config.daemon_gid,
            socket_name: config.socket_name.clone(),
            deadline: config.handoff_deadline(),
        }
    }
}

/// A bound, daemon-owned rendezvous socket that has not started
/// accepting yet.
#[derive(Debug)]
pub struct HandoffChannel {
    listener: UnixListener,
    socket: SocketFile,
    deadline: Duration,
}

impl HandoffChannel {
    /// Prepares the staging directory and binds the rendezvous socket.
    ///
    /// `staging` must exist. Its parent and the directory itself are
    /// chowned to the daemon identity before the socket is bound, and the
    /// socket right after.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Handoff`] if a chown or the bind fails. A socket
    /// file created before the failure is removed.
    pub fn bind(staging: &Path, settings: &HandoffSettings) -> Result<Self> {
        if let Some(parent) = staging.parent() {
            chown(parent, settings)?;
        }
        chown(staging, settings)?;

        let socket_path = staging.join(&settings.socket_name);
        remove_stale(&socket_path)?;

        let listener = if fits_sun_path(&socket_path) {
            UnixListener::bind(&socket_path).map_err(|e| handoff_error(&socket_path, &e))?
        } else {
            tracing::debug!(socket = %socket_path.display(), "socket path exceeds sun_path, binding relative");
            workdir::within(staging, || {
                UnixListener::bind(&settings.socket_name)
                    .map_err(|e| handoff_error(&socket_path, &e))
            })?
        };
        let socket = SocketFile::record(socket_path)?;
        chown(socket.path(), settings)?;
        listener
            .set_nonblocking(true)
            .map_err(|e| handoff_error(socket.path(), &e))?;

        tracing::info!(socket = %socket.path().display(), uid = settings.daemon_uid, gid = settings.daemon_gid, "rendezvous socket ready");
        Ok(Self {
            listener,
            socket,
            deadline: settings.deadline,
        })
    }

    /// Path of the bound socket.
    pub fn socket_path(&self) -> &Path {
        self.socket.path()
    }

    /// Starts accepting in a detached task.
    ///
    /// Must be called from within a tokio runtime. Aborting the returned
    /// task closes the listener, removes the socket, and closes `handle`.
    pub fn spawn(
        self,
        handle: FuseHandle,
        payload: Vec<u8>,
        channel: Arc<dyn DescriptorChannel>,
    ) -> JoinHandle<HandoffOutcome> {
        let Self {
            listener,
            socket,
            deadline,
        } = self;
        tokio::spawn(async move {
            let outcome = serve(listener, handle, payload, channel, deadline).await;
            match &outcome {
                HandoffOutcome::Delivered => {
                    tracing::info!(socket = %socket.path().display(), "FUSE handle handed to sidecar");
                }
                HandoffOutcome::Expired => {
                    tracing::warn!(socket = %socket.path().display(), ?deadline, "no sidecar connected before deadline");
                }
                HandoffOutcome::Failed(reason) => {
                    tracing::error!(socket = %socket.path().display(), reason, "handoff failed");
                }
            }
            drop(socket);
            outcome
        })
    }
}

async fn serve(
    listener: UnixListener,
    handle: FuseHandle,
    payload: Vec<u8>,
    channel: Arc<dyn DescriptorChannel>,
    deadline: Duration,
) -> HandoffOutcome {
    let listener = match tokio::net::UnixListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => return HandoffOutcome::Failed(e.to_string()),
    };
    let accepted = tokio::time::timeout(deadline, listener.accept()).await;
    drop(listener);

    let stream = match accepted {
        Err(_) => return HandoffOutcome::Expired,
        Ok(Err(e)) => return HandoffOutcome::Failed(format!("accept: {e}")),
        Ok(Ok((stream, _))) => stream,
    };
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => return HandoffOutcome::Failed(e.to_string()),
    };

    let sent = tokio::task::spawn_blocking(move || {
        stream.set_nonblocking(false)?;
        channel.send_descriptor(&stream, &payload, handle.as_fd())
    })
    .await;
    match sent {
        Ok(Ok(())) => HandoffOutcome::Delivered,
        Ok(Err(e)) => HandoffOutcome::Failed(format!("send: {e}")),
        Err(e) => HandoffOutcome::Failed(format!("send task: {e}")),
    }
}

/// Live rendezvous sessions keyed by staging directory.
///
/// At most one session exists per key; inserting over a live session
/// aborts it.
#[derive(Debug, Default)]
pub struct HandoffSessions {
    sessions: Mutex<HashMap<PathBuf, JoinHandle<HandoffOutcome>>>,
}

impl HandoffSessions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` for `key`, aborting any session it supersedes.
    pub fn insert(&self, key: PathBuf, task: JoinHandle<HandoffOutcome>) {
        let mut sessions = self.table();
        sessions.retain(|_, running| !running.is_finished());
        if let Some(previous) = sessions.insert(key.clone(), task) {
            previous.abort();
            tracing::info!(staging = %key.display(), "superseded previous rendezvous session");
        }
    }

    /// Aborts the session for `key`. Returns whether one was live.
    pub fn cancel(&self, key: &Path) -> bool {
        let Some(task) = self.table().remove(key) else {
            return false;
        };
        let live = !task.is_finished();
        task.abort();
        if live {
            tracing::info!(staging = %key.display(), "cancelled rendezvous session");
        }
        live
    }

    /// Returns whether a session for `key` is still running.
    pub fn is_active(&self, key: &Path) -> bool {
        self.table().get(key).is_some_and(|task| !task.is_finished())
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, JoinHandle<HandoffOutcome>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the socket file on drop, unless it has since been replaced by
/// a newer session's socket.
#[derive(Debug)]
struct SocketFile {
    path: PathBuf,
    identity: (u64, i64, i64),
}

impl SocketFile {
    fn record(path: PathBuf) -> Result<Self> {
        let identity = match std::fs::symlink_metadata(&path) {
            Ok(meta) => file_identity(&meta),
            Err(e) => {
                let err = handoff_error(&path, &e);
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };
        Ok(Self { path, identity })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if file_identity(&meta) == self.identity => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(socket = %self.path.display(), error = %e, "failed to remove socket");
                }
            }
            _ => {}
        }
    }
}

/// Inode numbers are recycled quickly, so the change time disambiguates
/// a re-created socket.
fn file_identity(meta: &std::fs::Metadata) -> (u64, i64, i64) {
    (meta.ino(), meta.ctime(), meta.ctime_nsec())
}

/// Whether `path` can be bound or connected to without changing directory.
pub fn fits_sun_path(path: &Path) -> bool {
    path.as_os_str().len() < SUN_PATH_MAX
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(handoff_error(path, &e)),
    }
}

fn chown(path: &Path, settings: &HandoffSettings) -> Result<()> {
    use nix::unistd::{Gid, Uid};

    nix::unistd::chown(
        path,
        Some(Uid::from_raw(settings.daemon_uid)),
        Some(Gid::from_raw(settings.daemon_gid)),
    )
    .map_err(|e| CsiError::Handoff {
        path: path.to_path_buf(),
        message: format!("chown to {}:{}: {e}", settings.daemon_uid, settings.daemon_gid),
    })
}

fn handoff_error(path: &Path, e: &std::io::Error) -> CsiError {
    CsiError::Handoff {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
