//! Wire format for messages carried on a VM's multiplexed I/O channel.
//!
//! Each message is tagged with the 64-bit sequence number (see
//! [`crate::vm::io_session::IoSession`]) that names the stream it
//! belongs to: `{sequence: u64 BE, length: u32 BE, payload}`. This is
//! the daemon's own concretization of the "opaque" guest I/O channel
//! named in the data model; the guest-agent's own byte-for-byte
//! framing is out of scope (see `DESIGN.md`).

use std::io::{Read, Write};

use crate::codec::ProtocolError;

pub struct IoMessage {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

pub fn read_io_message<R: Read + ?Sized>(stream: &mut R) -> Result<IoMessage, ProtocolError> {
    let mut header = [0u8; 12];
    read_exact_loop(stream, &mut header)?;
    let sequence = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap());
    let mut payload = vec![0u8; length as usize];
    read_exact_loop(stream, &mut payload)?;
    Ok(IoMessage { sequence, payload })
}

pub fn write_io_message<W: Write + ?Sized>(
    stream: &mut W,
    sequence: u64,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let mut header = [0u8; 12];
    header[0..8].copy_from_slice(&sequence.to_be_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    Ok(())
}

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
