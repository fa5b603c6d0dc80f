//! A single client's slice of a VM's multiplexed I/O channel.

use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::thread::JoinHandle;

/// One or two consecutive sequence numbers, a host-side socketpair end,
/// and the client that owns them.
///
/// `n_streams == 1`: stdin and stdout share `io_base`; the process's
/// stderr, if any, is not separately addressable.
/// `n_streams == 2`: stdin/stdout on `io_base`, stderr on `io_base + 1`.
pub struct IoSession {
    pub n_streams: u8,
    pub io_base: u64,
    pub owner_client_id: u64,
    /// The host end of the socketpair; the peer end's fd was handed to
    /// the client via [`crate::fdpass::send_fd`].
    pub host_end: UnixStream,
    /// The client->io pump serving this session, set once after spawn.
    pub(crate) pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoSession {
    /// `true` if `seq` is one of the `n_streams` sequence numbers this
    /// session occupies.
    pub fn owns_sequence(&self, seq: u64) -> bool {
        seq >= self.io_base && seq < self.io_base + self.n_streams as u64
    }

    /// Close the session end, waking the client->io pump, and block
    /// until it exits.
    pub(crate) fn close(&self) {
        let _ = self.host_end.shutdown(std::net::Shutdown::Both);
        if let Some(handle) = self.pump_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
