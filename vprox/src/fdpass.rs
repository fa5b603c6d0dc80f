//! Passing a single file descriptor across a local-domain stream socket.
//!
//! The local-domain stream transport does not deliver ancillary data
//! without at least one accompanying data byte, so every fd hand-off is
//! tagged with a mandatory `'F'` byte. Receivers must validate the tag
//! byte, the control-message count, and the descriptor count before
//! trusting the descriptor — mis-handling ancillary data is a security
//! concern, not just a correctness one.

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSlice;

const TAG_BYTE: u8 = b'F';

#[derive(Debug)]
pub enum FdPassError {
    Io(nix::Error),
    /// No ancillary data arrived with the tagged byte.
    NoAncillaryData,
    /// The single data byte was not the `'F'` tag.
    WrongTag(u8),
    /// More or less than exactly one control message arrived.
    WrongMessageCount(usize),
    /// The `SCM_RIGHTS` message did not carry exactly one descriptor.
    WrongFdCount(usize),
}

impl fmt::Display for FdPassError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error passing file descriptor: {}", e),
            Self::NoAncillaryData => write!(f, "no ancillary data received with fd tag byte"),
            Self::WrongTag(b) => write!(f, "expected tag byte 'F', got {:#x}", b),
            Self::WrongMessageCount(n) => {
                write!(f, "expected exactly one control message, got {}", n)
            }
            Self::WrongFdCount(n) => {
                write!(f, "expected exactly one file descriptor, got {}", n)
            }
        }
    }
}

impl std::error::Error for FdPassError {}

impl From<nix::Error> for FdPassError {
    fn from(e: nix::Error) -> Self {
        Self::Io(e)
    }
}

/// Send `fd` as ancillary data on `socket`, tagged with the mandatory data byte.
pub fn send_fd<S: AsRawFd>(socket: &S, fd: RawFd) -> Result<(), FdPassError> {
    let iov = [IoSlice::new(&[TAG_BYTE])];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    socket::sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive one file descriptor from `socket`. Returns an [`OwnedFd`] so a
/// caller that errors out after this call does not leak the descriptor.
pub fn recv_fd<S: AsRawFd>(socket: &S) -> Result<OwnedFd, FdPassError> {
    let mut data_buf = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [std::io::IoSliceMut::new(&mut data_buf)];

    let msg = socket::recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )?;

    if msg.bytes == 0 || data_buf[0] != TAG_BYTE {
        if msg.bytes == 0 {
            return Err(FdPassError::NoAncillaryData);
        }
        return Err(FdPassError::WrongTag(data_buf[0]));
    }

    let mut messages = msg.cmsgs().map_err(FdPassError::Io)?;
    let first = messages.next().ok_or(FdPassError::NoAncillaryData)?;
    if messages.next().is_some() {
        return Err(FdPassError::WrongMessageCount(2));
    }

    match first {
        ControlMessageOwned::ScmRights(fds) => {
            if fds.len() != 1 {
                // Close every fd we were handed before reporting the error.
                for fd in &fds {
                    let _ = nix::unistd::close(*fd);
                }
                return Err(FdPassError::WrongFdCount(fds.len()));
            }
            // SAFETY: the kernel just handed us a freshly dup'd, exclusively
            // owned descriptor via SCM_RIGHTS.
            Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
        }
        _ => Err(FdPassError::WrongMessageCount(1)),
    }
}
