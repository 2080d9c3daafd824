//! Descriptor passing to tapdisk NBD control sockets.
//!
//! Storage migration mirrors a tapdisk's writes to a second destination.
//! The destination is handed over as an open file descriptor sent over a
//! per-tapdisk Unix socket together with a token; the tapdisk then refers to
//! the destination as `nbd:<token>`.
//!
//! Descriptor passing is isolated behind [`MirrorChannel`] so that hosts
//! without `SCM_RIGHTS` support can plug in [`UnsupportedChannel`] and keep
//! the rest of the lifecycle working.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use thiserror::Error;
use tracing::debug;

/// Errors from mirror descriptor passing.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("descriptor passing is not supported on this host")]
    Unsupported,

    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to send descriptor to {}: {source}", .path.display())]
    Send {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("short write sending token to {}: {sent} of {expected} bytes", .path.display())]
    ShortWrite {
        path: PathBuf,
        sent: usize,
        expected: usize,
    },
}

/// Capability to hand an open descriptor to a tapdisk.
pub trait MirrorChannel: Send + Sync {
    /// Connect to `socket`, send `token` with `fd` attached, then disconnect.
    fn send_fd(&self, socket: &Path, token: &str, fd: BorrowedFd<'_>) -> Result<(), MirrorError>;
}

/// `SCM_RIGHTS` over a Unix stream socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixFdChannel;

impl MirrorChannel for UnixFdChannel {
    fn send_fd(&self, socket: &Path, token: &str, fd: BorrowedFd<'_>) -> Result<(), MirrorError> {
        let stream = UnixStream::connect(socket).map_err(|source| MirrorError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;

        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(token.as_bytes())];

        let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(|source| MirrorError::Send {
                path: socket.to_path_buf(),
                source,
            })?;

        if sent != token.len() {
            return Err(MirrorError::ShortWrite {
                path: socket.to_path_buf(),
                sent,
                expected: token.len(),
            });
        }

        debug!(socket = %socket.display(), token = %token, "Sent descriptor");
        Ok(())
    }
}

/// Channel for hosts that cannot pass descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedChannel;

impl MirrorChannel for UnsupportedChannel {
    fn send_fd(&self, _socket: &Path, _token: &str, _fd: BorrowedFd<'_>) -> Result<(), MirrorError> {
        Err(MirrorError::Unsupported)
    }
}
