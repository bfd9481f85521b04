//! Descriptor passing over Unix stream sockets.
//!
//! A handoff message is one `sendmsg(2)` carrying a small JSON payload in
//! the data bytes and exactly one descriptor as `SCM_RIGHTS` ancillary
//! data. The receiving side rejects anything else.

use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};

/// Largest payload accepted by [`ScmRights::receive_descriptor`].
pub const MAX_PAYLOAD: usize = 4096;

/// Descriptor slots reserved on receive. More than one is a protocol
/// error, but reserving a few lets the extras be closed instead of
/// silently truncated.
const RECV_FD_SLOTS: usize = 4;

/// Transfers one descriptor plus a payload over a connected stream.
pub trait DescriptorChannel: Send + Sync {
    /// Sends `payload` with `fd` attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is empty or `sendmsg(2)` fails or
    /// writes short.
    fn send_descriptor(
        &self,
        stream: &UnixStream,
        payload: &[u8],
        fd: BorrowedFd<'_>,
    ) -> io::Result<()>;

    /// Receives one message that must carry exactly one descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidData`] when zero or several descriptors
    /// arrive or the control message is malformed, and
    /// [`ErrorKind::UnexpectedEof`] when the peer closed without sending.
    fn receive_descriptor(&self, stream: &UnixStream) -> io::Result<(OwnedFd, Vec<u8>)>;
}

/// [`DescriptorChannel`] using `SCM_RIGHTS` ancillary data.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmRights;

impl DescriptorChannel for ScmRights {
    fn send_descriptor(
        &self,
        stream: &UnixStream,
        payload: &[u8],
        fd: BorrowedFd<'_>,
    ) -> io::Result<()> {
        send_with_fds(stream, payload, &[fd.as_raw_fd()])
    }

    fn receive_descriptor(&self, stream: &UnixStream) -> io::Result<(OwnedFd, Vec<u8>)> {
        let (mut fds, payload) = recv_with_fds(stream)?;
        match fds.len() {
            1 => {
                let fd = fds.remove(0);
                tracing::debug!(fd = fd.as_raw_fd(), bytes = payload.len(), "received descriptor");
                Ok((fd, payload))
            }
            0 => Err(io::Error::new(
                ErrorKind::InvalidData,
                "message carried no descriptor",
            )),
            n => Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("expected exactly one descriptor, got {n}"),
            )),
        }
    }
}

fn send_with_fds(stream: &UnixStream, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
    if payload.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "empty payload"));
    }
    let iov = [IoSlice::new(payload)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, send_flags(), None) {
            Ok(sent) if sent == payload.len() => return Ok(()),
            Ok(sent) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    format!("short write: {sent} of {} bytes", payload.len()),
                ));
            }
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn recv_with_fds(stream: &UnixStream) -> io::Result<(Vec<OwnedFd>, Vec<u8>)> {
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; RECV_FD_SLOTS]);
    let (n, flags, fds) = loop {
        match recv_once(stream, &mut buf, &mut cmsg_buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            other => break other?,
        }
    };

    // The descriptors are owned by now, so every error below closes them.
    if flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(io::Error::from(Errno::EMSGSIZE));
    }
    if n == 0 {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed before sending",
        ));
    }
    buf.truncate(n);
    Ok((fds, buf))
}

/// One `recvmsg(2)`; returns the byte count, the message flags and the
/// received descriptors.
fn recv_once(
    stream: &UnixStream,
    buf: &mut [u8],
    cmsg_buf: &mut [u8],
) -> io::Result<(usize, MsgFlags, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(cmsg_buf), recv_flags())?;
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::from(Errno::EMSGSIZE));
    }
    let mut fds = Vec::new();
    let mut foreign = false;
    for cmsg in msg.cmsgs()? {
        match cmsg {
            ControlMessageOwned::ScmRights(raw) => fds.extend(raw.into_iter().map(adopt)),
            _ => foreign = true,
        }
    }
    if foreign {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "unexpected control message type",
        ));
    }
    Ok((msg.bytes, msg.flags, fds))
}

#[allow(unsafe_code)]
fn adopt(fd: RawFd) -> OwnedFd {
    // SAFETY: the kernel installed this descriptor in this process for
    // this message; nothing else refers to it.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(target_os = "linux")]
const fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
const fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(target_os = "linux")]
const fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
const fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn descriptor_and_payload_arrive_together() {
        let (left, right) = UnixStream::pair().expect("pair");
        let mut file = tempfile::tempfile().expect("tempfile");

        ScmRights
            .send_descriptor(&left, br#"{"volumeName":"v1"}"#, file.as_fd())
            .expect("send");
        let (fd, payload) = ScmRights.receive_descriptor(&right).expect("receive");
        assert_eq!(payload, br#"{"volumeName":"v1"}"#);

        // Both descriptors share one open file description.
        let mut received = File::from(fd);
        received.write_all(b"through the socket").expect("write");
        let _ = file.seek(SeekFrom::Start(0)).expect("seek");
        let mut content = String::new();
        let _ = file.read_to_string(&mut content).expect("read");
        assert_eq!(content, "through the socket");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn received_descriptor_is_close_on_exec() {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};

        let (left, right) = UnixStream::pair().expect("pair");
        let file = tempfile::tempfile().expect("tempfile");
        ScmRights
            .send_descriptor(&left, b"{}", file.as_fd())
            .expect("send");
        let (fd, _) = ScmRights.receive_descriptor(&right).expect("receive");
        let flags = FdFlag::from_bits_truncate(fcntl(&fd, FcntlArg::F_GETFD).expect("getfd"));
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn plain_message_is_rejected() {
        let (mut left, right) = UnixStream::pair().expect("pair");
        left.write_all(b"no fd here").expect("write");
        let err = ScmRights.receive_descriptor(&right).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn two_descriptors_are_rejected() {
        let (left, right) = UnixStream::pair().expect("pair");
        let a = tempfile::tempfile().expect("tempfile");
        let b = tempfile::tempfile().expect("tempfile");
        send_with_fds(&left, b"{}", &[a.as_raw_fd(), b.as_raw_fd()]).expect("send");
        let err = ScmRights.receive_descriptor(&right).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("got 2"));
    }

    #[test]
    fn closed_peer_is_eof() {
        let (left, right) = UnixStream::pair().expect("pair");
        drop(left);
        let err = ScmRights.receive_descriptor(&right).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn empty_payload_is_refused() {
        let (left, _right) = UnixStream::pair().expect("pair");
        let file = tempfile::tempfile().expect("tempfile");
        let err = ScmRights
            .send_descriptor(&left, b"", file.as_fd())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
