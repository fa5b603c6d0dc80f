//! A VM session: the two guest channels for one registered container,
//! its pool of I/O sessions, and the background pumps that keep them
//! moving.

pub mod io_session;
pub mod iomsg;
pub mod lost;
pub mod pumps;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

pub use io_session::IoSession;
pub use lost::VmLost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Registered,
    Connected,
    Lost,
    Destroyed,
}

#[derive(Debug)]
pub enum VmError {
    AlreadyConnected,
    NotConnected,
    Lost,
    InvalidStreamCount(u8),
    Handshake(String),
    Io(io::Error),
    Protocol(crate::codec::ProtocolError),
    Guest(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyConnected => write!(f, "VM session is already connected"),
            Self::NotConnected => write!(f, "VM session is not connected"),
            Self::Lost => write!(f, "VM session has been lost"),
            Self::InvalidStreamCount(n) => write!(f, "invalid stream count {}, must be 1 or 2", n),
            Self::Handshake(e) => write!(f, "guest-agent ready handshake failed: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error talking to guest: {}", e),
            Self::Guest(e) => write!(f, "guest returned an error: {}", e),
        }
    }
}

impl std::error::Error for VmError {}

impl From<io::Error> for VmError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<crate::codec::ProtocolError> for VmError {
    fn from(e: crate::codec::ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

struct Inner {
    next_io_base: u64,
    io_sessions: BTreeMap<u64, Arc<IoSession>>,
}

type HandshakeFn = dyn Fn(&UnixStream, &UnixStream) -> io::Result<()> + Send + Sync;

/// The process-wide record of one registered container: everything
/// named `VMRecord` in the data model.
pub struct VmSession {
    pub container_id: String,
    pub ctl_path: PathBuf,
    pub io_path: PathBuf,
    pub console_path: Option<PathBuf>,

    state: Mutex<VmState>,
    inner: Mutex<Inner>,
    ctl_handle: Mutex<Option<UnixStream>>,
    io_handle: Mutex<Option<UnixStream>>,
    pub vm_lost: VmLost,
    pump_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    ready_handshake: Box<HandshakeFn>,
    max_frame_len: u32,
}

/// The default guest-agent READY handshake: one JSON request/response
/// exchanged over the ctl channel, using the same framing `send_ctl`
/// uses for every later ctl command. The real guest-agent's own wire
/// format is opaque to this daemon (see the data model); this is the
/// daemon's own minimal stand-in, so that a process that never answers,
/// or answers negatively, fails `connect()` instead of being silently
/// treated as ready.
fn default_ready_handshake(ctl: &UnixStream, _io: &UnixStream, max_frame_len: u32) -> io::Result<()> {
    let mut ctl = ctl.try_clone()?;
    let request = serde_json::json!({ "name": "ready", "data": null });
    let bytes = serde_json::to_vec(&request)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    crate::codec::write_frame(&mut ctl, &bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let frame = crate::codec::read_frame(&mut ctl, max_frame_len)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let response: serde_json::Value = serde_json::from_slice(&frame.payload)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let success = response.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    if success {
        Ok(())
    } else {
        let message = response
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("guest reported not ready")
            .to_string();
        Err(io::Error::new(io::ErrorKind::Other, message))
    }
}

impl VmSession {
    pub fn new(
        container_id: String,
        ctl_path: PathBuf,
        io_path: PathBuf,
        console_path: Option<PathBuf>,
        max_frame_len: u32,
    ) -> Arc<Self> {
        Self::new_with_handshake(
            container_id,
            ctl_path,
            io_path,
            console_path,
            max_frame_len,
            move |ctl, io| default_ready_handshake(ctl, io, max_frame_len),
        )
    }

    /// Like [`Self::new`] but lets callers (tests) inject the otherwise
    /// opaque guest-agent READY handshake.
    pub fn new_with_handshake<F>(
        container_id: String,
        ctl_path: PathBuf,
        io_path: PathBuf,
        console_path: Option<PathBuf>,
        max_frame_len: u32,
        handshake: F,
    ) -> Arc<Self>
    where
        F: Fn(&UnixStream, &UnixStream) -> io::Result<()> + Send + Sync + 'static,
    {
        Arc::new(VmSession {
            container_id,
            ctl_path,
            io_path,
            console_path,
            state: Mutex::new(VmState::Registered),
            inner: Mutex::new(Inner {
                next_io_base: 1,
                io_sessions: BTreeMap::new(),
            }),
            ctl_handle: Mutex::new(None),
            io_handle: Mutex::new(None),
            vm_lost: VmLost::default(),
            pump_handles: Mutex::new(Vec::new()),
            ready_handshake: Box::new(handshake),
            max_frame_len,
        })
    }

    pub fn state(&self) -> VmState {
        *self.state.lock().unwrap()
    }

    /// Open the ctl and io channels, run the guest-agent READY
    /// handshake, and spawn the background pumps. Idempotent only in
    /// the sense that calling it twice on a non-`Registered` session is
    /// rejected; it is not retried internally.
    pub fn connect(self: &Arc<Self>, console_dump: bool) -> Result<(), VmError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != VmState::Registered {
                return Err(VmError::AlreadyConnected);
            }
            *state = VmState::Connected;
        }

        if console_dump {
            if let Some(path) = self.console_path.clone() {
                match UnixStream::connect(&path) {
                    Ok(stream) => {
                        let vm = Arc::clone(self);
                        let handle = thread::spawn(move || pumps::console_pump(vm, stream));
                        self.pump_handles.lock().unwrap().push(handle);
                    }
                    Err(e) => {
                        log::warn!(
                            "{}: could not open console channel at {:?}: {}",
                            self.container_id,
                            path,
                            e
                        );
                    }
                }
            }
        }

        let ctl = UnixStream::connect(&self.ctl_path)?;
        let io = UnixStream::connect(&self.io_path)?;
        (self.ready_handshake)(&ctl, &io).map_err(|e| VmError::Handshake(e.to_string()))?;

        let io_for_pump = io.try_clone()?;
        *self.ctl_handle.lock().unwrap() = Some(ctl);
        *self.io_handle.lock().unwrap() = Some(io);

        let vm = Arc::clone(self);
        let io_handle = thread::spawn(move || pumps::io_to_clients_pump(vm, io_for_pump));
        self.pump_handles.lock().unwrap().push(io_handle);

        let vm = Arc::clone(self);
        let supervisor = thread::spawn(move || {
            vm.vm_lost.wait();
            vm.close();
        });
        self.pump_handles.lock().unwrap().push(supervisor);

        Ok(())
    }

    /// Forward an opaque command to the guest over the ctl channel.
    /// Serialised: only one outstanding ctl message at a time.
    pub fn send_ctl(
        &self,
        name: &str,
        data: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, VmError> {
        if self.vm_lost.has_fired() {
            return Err(VmError::Lost);
        }
        let mut guard = self.ctl_handle.lock().unwrap();
        let stream = guard.as_mut().ok_or(VmError::NotConnected)?;

        let request = serde_json::json!({ "name": name, "data": data });
        let bytes = serde_json::to_vec(&request).map_err(|e| VmError::Guest(e.to_string()))?;
        crate::codec::write_frame(stream, &bytes)?;

        let frame = crate::codec::read_frame(stream, self.max_frame_len)?;
        let response: serde_json::Value =
            serde_json::from_slice(&frame.payload).map_err(|e| VmError::Guest(e.to_string()))?;

        let success = response.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !success {
            let message = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("guest reported failure")
                .to_string();
            return Err(VmError::Guest(message));
        }
        Ok(response.get("data").cloned().unwrap_or(serde_json::json!({})))
    }

    /// Allocate one or two sequence numbers and a socketpair for a new
    /// client I/O stream, spawning the client->io pump that serves it.
    pub fn allocate_io(
        self: &Arc<Self>,
        n_streams: u8,
        owner_client_id: u64,
    ) -> Result<(u64, OwnedFd), VmError> {
        if !(1..=2).contains(&n_streams) {
            return Err(VmError::InvalidStreamCount(n_streams));
        }
        if self.vm_lost.has_fired() {
            return Err(VmError::Lost);
        }

        let guest_io = {
            let guard = self.io_handle.lock().unwrap();
            match guard.as_ref() {
                Some(h) => h.try_clone()?,
                None => return Err(VmError::NotConnected),
            }
        };

        let (host_end, client_end) = UnixStream::pair()?;

        let io_base = {
            let mut inner = self.inner.lock().unwrap();
            let io_base = inner.next_io_base;
            inner.next_io_base += n_streams as u64;

            let pump_reader = match host_end.try_clone() {
                Ok(s) => s,
                Err(e) => return Err(VmError::Io(e)),
            };
            let session = Arc::new(IoSession {
                n_streams,
                io_base,
                owner_client_id,
                host_end,
                pump_handle: Mutex::new(None),
            });
            for key in io_base..io_base + n_streams as u64 {
                inner.io_sessions.insert(key, Arc::clone(&session));
            }

            let vm = Arc::clone(self);
            let handle =
                thread::spawn(move || pumps::client_to_io_pump(vm, io_base, pump_reader, guest_io));
            *session.pump_handle.lock().unwrap() = Some(handle);

            io_base
        };

        let client_fd = client_end.into_raw_fd();
        Ok((io_base, unsafe { OwnedFd::from_raw_fd(client_fd) }))
    }

    /// O(1) lookup of the session owning a given sequence number.
    pub fn find_session(&self, sequence: u64) -> Option<Arc<IoSession>> {
        self.inner.lock().unwrap().io_sessions.get(&sequence).cloned()
    }

    /// Tear down one I/O session: close its host end (waking the
    /// client->io pump), wait for the pump, and remove every key it
    /// occupied.
    pub fn destroy_io_session(&self, io_base: u64) {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner.io_sessions.get(&io_base).cloned();
            if let Some(session) = &session {
                for key in session.io_base..session.io_base + session.n_streams as u64 {
                    inner.io_sessions.remove(&key);
                }
            }
            session
        };
        if let Some(session) = session {
            session.close();
        }
    }

    /// Invoked by the io->clients pump when the guest's io channel
    /// reads EOF or errors: transitions to `Lost` and fires `vm_lost`.
    /// The supervisor thread spawned in `connect()` performs the actual
    /// teardown exactly once.
    pub fn on_guest_lost(&self) {
        *self.state.lock().unwrap() = VmState::Lost;
        self.vm_lost.fire();
    }

    /// Idempotent: fire `vm_lost`, close every I/O session (waking and
    /// joining its client->io pump), and shut down the ctl/io handles so
    /// the io->clients pump and console pump observe EOF. Does not join
    /// those pumps or the supervisor thread itself — the supervisor
    /// calls `close()` from inside one of them, and joining your own
    /// thread deadlocks. Use [`Self::shutdown_and_join`] from any other
    /// thread when those need to be waited on too.
    pub fn close(&self) {
        self.vm_lost.fire();

        let mut inner = self.inner.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut unique_sessions = Vec::new();
        for session in inner.io_sessions.values() {
            if seen.insert(session.io_base) {
                unique_sessions.push(Arc::clone(session));
            }
        }
        inner.io_sessions.clear();
        drop(inner);

        for session in unique_sessions {
            session.close();
        }

        if let Some(ctl) = self.ctl_handle.lock().unwrap().take() {
            let _ = ctl.shutdown(std::net::Shutdown::Both);
        }
        if let Some(io) = self.io_handle.lock().unwrap().take() {
            let _ = io.shutdown(std::net::Shutdown::Both);
        }

        *self.state.lock().unwrap() = VmState::Destroyed;
    }

    /// Close the session and block until its io->clients pump, console
    /// pump, and supervisor thread have all exited. Intended for use by
    /// the listener's shutdown path, from a thread other than any of
    /// the session's own pumps.
    pub fn shutdown_and_join(&self) {
        self.close();
        let handles: Vec<_> = std::mem::take(&mut *self.pump_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}
