//! Socket rendezvous and descriptor plumbing.
//!
//! The bus lives on one filesystem unix socket. The daemon binds it (stale
//! file removed, parent directory created) and unlinks it on drop; clients
//! connect with a blocking stream. A client's signal-group descriptor
//! travels to the server as SCM_RIGHTS ancillary data on the register-proxy
//! request. All stream writes go through `send(2)` with MSG_NOSIGNAL so a
//! dead peer surfaces as EPIPE instead of killing the process.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recv, recvmsg, send, sendmsg,
};

use crate::error::{Error, Result};

/// Environment variable overriding the rendezvous socket location.
pub const SOCKET_PATH_ENV: &str = "SAFTBUS_SOCKET_PATH";

/// Default rendezvous socket location.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/saftbus/saftbus";

/// Most SCM_RIGHTS descriptors accepted per message.
const MAX_PASSED_FDS: usize = 4;

const RECV_CHUNK_BYTES: usize = 64 * 1024;

/// Resolve the socket path: explicit override, then environment, then default.
pub fn socket_path(override_path: Option<PathBuf>) -> PathBuf {
    override_path
        .or_else(|| std::env::var_os(SOCKET_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// The daemon's listening socket. Unlinks its filesystem entry on drop.
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path)?;
        }
        let inner = UnixListener::bind(path)?;
        inner.set_nonblocking(true)?;
        tracing::debug!(path = %path.display(), "Bound bus socket");
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection, or `None` when nothing is queued.
    pub fn accept(&self) -> Result<Option<UnixStream>> {
        match self.inner.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to unlink bus socket");
        }
    }
}

/// Connect to a bus socket.
pub fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("connecting to bus socket {}: {e}", path.display()),
        ))
    })
}

/// Write a complete buffer, optionally attaching descriptors to the first
/// `sendmsg`. The kernel delivers the ancillary data with the leading bytes.
pub fn send_all(fd: RawFd, bytes: &[u8], attach: &[RawFd]) -> Result<()> {
    let mut offset = 0usize;
    let mut attach = attach;
    while offset < bytes.len() {
        let sent = if attach.is_empty() {
            match send(fd, &bytes[offset..], MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        } else {
            let iov = [std::io::IoSlice::new(&bytes[offset..])];
            let cmsgs = [ControlMessage::ScmRights(attach)];
            match sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(n) => {
                    attach = &[];
                    n
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if sent == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "peer stopped accepting bytes",
            )));
        }
        offset += sent;
    }
    Ok(())
}

/// Outcome of a best-effort non-blocking write to a signal sink.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The sink's buffer is momentarily full; the envelope is dropped for
    /// this subscriber only.
    WouldBlock,
    /// The sink is dead and must be culled.
    Broken,
}

/// Non-blocking single-shot write used for signal fan-out. Never blocks the
/// loop on one slow subscriber.
pub fn try_send_all(fd: RawFd, bytes: &[u8]) -> SendOutcome {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match send(fd, &bytes[offset..], MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => return SendOutcome::Broken,
            Ok(n) => offset += n,
            Err(nix::errno::Errno::EINTR) => continue,
            // A partial envelope cannot be recalled; waiting is not an
            // option on the loop thread, so a full buffer mid-frame also
            // counts as broken.
            Err(nix::errno::Errno::EAGAIN) => {
                return if offset == 0 {
                    SendOutcome::WouldBlock
                } else {
                    SendOutcome::Broken
                };
            }
            Err(_) => return SendOutcome::Broken,
        }
    }
    SendOutcome::Sent
}

/// Bytes and descriptors produced by one `recvmsg`.
pub struct RecvOutcome {
    /// Zero means end-of-stream.
    pub bytes: usize,
    pub fds: Vec<OwnedFd>,
}

/// Read once from `fd`, appending data to `buf` and adopting any passed
/// descriptors. Blocks if the descriptor is in blocking mode and nothing is
/// queued; under the event loop it is only called after readiness.
pub fn recv_with_fds(fd: RawFd, buf: &mut BytesMut) -> Result<RecvOutcome> {
    let mut scratch = [0u8; RECV_CHUNK_BYTES];
    let mut fds = Vec::new();
    let bytes = loop {
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
        let mut iov = [std::io::IoSliceMut::new(&mut scratch)];
        match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty()) {
            Ok(msg) => {
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        for raw in raw_fds {
                            // SAFETY: SCM_RIGHTS hands us freshly installed
                            // descriptors owned by nobody else in this process.
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                break msg.bytes;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    };
    buf.extend_from_slice(&scratch[..bytes]);
    Ok(RecvOutcome { bytes, fds })
}

/// Blocking read of exactly one frame, buffering any surplus in `buf`.
pub fn read_frame_blocking<T: serde::de::DeserializeOwned>(
    fd: RawFd,
    buf: &mut BytesMut,
) -> Result<T> {
    loop {
        if let Some(frame) = super::codec::decode_frame(buf)? {
            return Ok(frame);
        }
        let mut scratch = [0u8; RECV_CHUNK_BYTES];
        let n = loop {
            match recv(fd, &mut scratch, MsgFlags::empty()) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        buf.extend_from_slice(&scratch[..n]);
    }
}

/// Flip a passed descriptor to non-blocking before it joins the signal
/// fan-out set.
pub fn into_nonblocking(fd: OwnedFd) -> Result<OwnedFd> {
    let stream = UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(stream.into())
}

/// Borrow a raw descriptor for a poll entry.
///
/// SAFETY contract for callers: the descriptor must stay open for the
/// borrow's lifetime; every registrant owns its fd alongside the source it
/// registers and removes the source before closing the fd.
pub(crate) fn borrow_raw<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // SAFETY: see the function contract above.
    unsafe { BorrowedFd::borrow_raw(fd) }
}
