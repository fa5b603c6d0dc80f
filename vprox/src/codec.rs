//! Length-prefixed framing shared by every stream socket in the daemon:
//! the client-facing RPC connections and the host's own view of the
//! guest's I/O channel (see [`crate::vm::pumps`]).
//!
//! Frame = 8-byte big-endian header `{length: u32, flags: u32}` followed
//! by `length` bytes of payload. `flags` is reserved and must be written
//! as zero; readers accept any value.

use std::fmt;
use std::io::{self, Read, Write};

/// Refuse to allocate a buffer for a frame longer than this many bytes.
/// An implementer-chosen safety cap, not part of the wire contract.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum ProtocolError {
    /// Header or payload ended before it was fully read.
    ShortRead,
    /// The declared length exceeds [`MAX_FRAME_LEN`].
    FrameTooLarge(u32),
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ShortRead => write!(f, "short read while decoding a frame"),
            Self::FrameTooLarge(len) => {
                write!(f, "frame length {} exceeds the {}-byte cap", len, MAX_FRAME_LEN)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read `buf.len()` bytes from `stream`, looping over short reads. A
/// zero-byte read (EOF) before the buffer is full is a [`ProtocolError::ShortRead`].
fn read_exact_loop<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(ProtocolError::ShortRead);
        }
        filled += n;
    }
    Ok(())
}

/// Write the full buffer to `stream`, retrying on partial writes.
fn write_all_loop<W: Write + ?Sized>(stream: &mut W, buf: &[u8]) -> Result<(), ProtocolError> {
    stream.write_all(buf)?;
    Ok(())
}

/// Read one frame, rejecting a declared length over `max_len`. Callers
/// pass the configured `Config::max_frame_len` rather than
/// [`MAX_FRAME_LEN`] directly, so the limit in `vprox.toml` actually
/// takes effect.
pub fn read_frame<R: Read + ?Sized>(stream: &mut R, max_len: u32) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; 8];
    read_exact_loop(stream, &mut header)?;
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let flags = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if length > max_len {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    read_exact_loop(stream, &mut payload)?;
    Ok(Frame { flags, payload })
}

pub fn write_frame<W: Write + ?Sized>(stream: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let length = payload.len() as u32;
    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&length.to_be_bytes());
    header[4..8].copy_from_slice(&0u32.to_be_bytes());
    write_all_loop(stream, &header)?;
    write_all_loop(stream, payload)?;
    Ok(())
}
