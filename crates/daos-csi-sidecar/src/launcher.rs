//! Receiving one FUSE handle and running the daemon on it.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use daos_csi_common::constants::DAEMON_FUSE_FD;
use daos_csi_common::error::{CsiError, Result};
use daos_csi_common::types::HandoffPayload;
use daos_csi_core::fdpass::DescriptorChannel;
use daos_csi_core::handoff::fits_sun_path;
use daos_csi_core::workdir;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;

/// One staged volume inside the shared emptyDir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDir {
    dir: PathBuf,
    socket_name: String,
    error_file_name: String,
}

impl VolumeDir {
    /// Describes the staging directory `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        socket_name: impl Into<String>,
        error_file_name: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            socket_name: socket_name.into(),
            error_file_name: error_file_name.into(),
        }
    }

    /// The staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Volume name, taken from the directory name.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Rendezvous socket of this volume.
    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(&self.socket_name)
    }

    /// Error file the driver inspects on publish.
    pub fn error_path(&self) -> PathBuf {
        self.dir.join(&self.error_file_name)
    }

    /// Appends `message` to the error file. Failures are only logged.
    pub fn record_failure(&self, message: &str) {
        let path = self.error_path();
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{message}"));
        if let Err(e) = written {
            tracing::error!(error_file = %path.display(), error = %e, "failed to record sidecar failure");
        }
    }
}

/// What the driver handed over for one volume.
#[derive(Debug)]
pub struct Handoff {
    /// Mounted FUSE handle.
    pub fuse_fd: OwnedFd,
    /// Which DAOS container to serve.
    pub payload: HandoffPayload,
}

/// Connects to the volume's socket and receives the handle.
///
/// # Errors
///
/// Returns [`CsiError::Handoff`] when the socket cannot be reached or the
/// message does not carry exactly one descriptor, and a serialization
/// error when the payload is not valid JSON.
pub fn receive(volume: &VolumeDir, channel: &dyn DescriptorChannel) -> Result<Handoff> {
    let socket = volume.socket_path();
    let stream = if fits_sun_path(&socket) {
        UnixStream::connect(&socket).map_err(|e| handoff_error(&socket, &e))?
    } else {
        workdir::within(volume.dir(), || {
            UnixStream::connect(&volume.socket_name).map_err(|e| handoff_error(&socket, &e))
        })?
    };
    let (fuse_fd, bytes) = channel
        .receive_descriptor(&stream)
        .map_err(|e| handoff_error(&socket, &e))?;
    let payload = HandoffPayload::decode(&bytes)?;
    tracing::info!(
        volume = %payload.volume_name,
        pool = %payload.pool_name,
        container = %payload.container_name,
        fd = fuse_fd.as_raw_fd(),
        "received FUSE handle"
    );
    Ok(Handoff { fuse_fd, payload })
}

/// Command line for serving `payload` from the handle at fd 3.
///
/// # Errors
///
/// Returns [`CsiError::InvalidArgument`] with an `Incorrect Usage` message
/// when the pool or container is missing.
pub fn daemon_args(payload: &HandoffPayload) -> Result<Vec<String>> {
    if payload.pool_name.is_empty() {
        return Err(CsiError::invalid_argument("Incorrect Usage: missing pool name"));
    }
    if payload.container_name.is_empty() {
        return Err(CsiError::invalid_argument(
            "Incorrect Usage: missing container name",
        ));
    }
    Ok(vec![
        "--pool".to_string(),
        payload.pool_name.clone(),
        "--container".to_string(),
        payload.container_name.clone(),
        "--mountpoint".to_string(),
        format!("/dev/fd/{DAEMON_FUSE_FD}"),
    ])
}

/// A running filesystem daemon.
#[derive(Debug)]
pub struct Daemon {
    child: Child,
    tee: Option<JoinHandle<()>>,
    volume: VolumeDir,
}

impl Daemon {
    /// Process id of the daemon.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Volume the daemon serves.
    pub const fn volume(&self) -> &VolumeDir {
        &self.volume
    }

    /// Waits for the daemon to exit and records an abnormal exit in the
    /// error file.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Io`] if waiting on the child fails.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait().map_err(|e| CsiError::Io {
            path: self.volume.dir().to_path_buf(),
            source: e,
        })?;
        if let Some(tee) = self.tee.take() {
            let _ = tee.join();
        }
        match describe_exit(status) {
            Some(description) => {
                tracing::warn!(volume = %self.volume.name(), status = %description, "daemon exited abnormally");
                self.volume.record_failure(&description);
            }
            None => tracing::info!(volume = %self.volume.name(), "daemon exited"),
        }
        Ok(status)
    }
}

/// Starts `daemon` with `fuse_fd` installed as fd 3.
///
/// The daemon's stdout is inherited; its stderr is copied both to this
/// process's stderr and to the volume's error file. This process's copy of
/// the handle is closed once the child exists.
///
/// # Errors
///
/// Returns [`CsiError::Io`] if the error file cannot be opened or the
/// process cannot be spawned.
pub fn spawn_daemon(
    daemon: &Path,
    args: &[String],
    fuse_fd: OwnedFd,
    volume: &VolumeDir,
) -> Result<Daemon> {
    let error_path = volume.error_path();
    let error_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&error_path)
        .map_err(|e| CsiError::Io {
            path: error_path,
            source: e,
        })?;

    let raw = fuse_fd.as_raw_fd();
    let mut cmd = Command::new(daemon);
    let _ = cmd
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped());
    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions.
    #[allow(unsafe_code)]
    let _ = unsafe { cmd.pre_exec(move || install_fuse_fd(raw)) };

    tracing::info!(daemon = %daemon.display(), ?args, volume = %volume.name(), "starting daemon");
    let mut child = cmd.spawn().map_err(|e| CsiError::Io {
        path: daemon.to_path_buf(),
        source: e,
    })?;
    drop(fuse_fd);

    let tee = child
        .stderr
        .take()
        .map(|stderr| tee_stderr(stderr, error_file));
    Ok(Daemon {
        child,
        tee,
        volume: volume.clone(),
    })
}

/// Receives the handle for `volume` and starts the daemon on it.
///
/// Any failure is also written to the volume's error file.
///
/// # Errors
///
/// Returns the first error of [`receive`], [`daemon_args`], or
/// [`spawn_daemon`].
pub fn launch(volume: &VolumeDir, channel: &dyn DescriptorChannel, daemon: &Path) -> Result<Daemon> {
    let result = receive(volume, channel).and_then(|handoff| {
        let args = daemon_args(&handoff.payload)?;
        spawn_daemon(daemon, &args, handoff.fuse_fd, volume)
    });
    if let Err(e) = &result {
        volume.record_failure(&e.to_string());
    }
    result
}

/// Describes an unsuccessful exit the way the driver classifies it.
///
/// Returns `None` for a successful exit.
pub fn describe_exit(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    if let Some(signal) = status.signal() {
        return Some(format!("signal: {}", signal_name(signal)));
    }
    status.code().map(|code| format!("exit status {code}"))
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGKILL => "killed".to_string(),
        libc::SIGTERM => "terminated".to_string(),
        libc::SIGINT => "interrupt".to_string(),
        libc::SIGHUP => "hangup".to_string(),
        libc::SIGABRT => "aborted".to_string(),
        libc::SIGSEGV => "segmentation fault".to_string(),
        other => nix::sys::signal::Signal::try_from(other)
            .map_or_else(|_| format!("signal {other}"), |s| s.as_str().to_string()),
    }
}

/// Makes `fd` available to the exec'd program as [`DAEMON_FUSE_FD`].
#[allow(unsafe_code)]
fn install_fuse_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: the handle stays open in the child until exec.
    let handle = unsafe { BorrowedFd::borrow_raw(fd) };
    if fd == DAEMON_FUSE_FD {
        let flags = FdFlag::from_bits_truncate(fcntl(handle, FcntlArg::F_GETFD)?);
        let _ = fcntl(handle, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
        return Ok(());
    }
    // SAFETY: the slot is never dropped, so only its number is used; the
    // duplicate does not inherit FD_CLOEXEC and must survive exec.
    let mut slot = ManuallyDrop::new(unsafe { OwnedFd::from_raw_fd(DAEMON_FUSE_FD) });
    dup2(handle, &mut slot)?;
    Ok(())
}

fn tee_stderr(mut source: ChildStderr, mut sink: File) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut stderr = io::stderr();
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "daemon stderr closed");
                    break;
                }
            };
            let _ = stderr.write_all(&buf[..n]);
            if let Err(e) = sink.write_all(&buf[..n]) {
                tracing::warn!(error = %e, "failed to copy daemon stderr to error file");
            }
        }
    })
}

fn handoff_error(path: &Path, e: &io::Error) -> CsiError {
    CsiError::Handoff {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
