//! Listener acquisition (socket activation or path mode) and the
//! accept loop / graceful shutdown.

use std::fmt;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::client;
use crate::config::Config;
use crate::registry::VmRegistry;

/// First inherited fd under the systemd socket-activation convention.
const SD_LISTEN_FDS_START: RawFd = 3;

#[derive(Debug)]
pub enum ListenError {
    /// More than one pre-opened listening socket was inherited.
    TooManySocketsActivated(usize),
    Io(io::Error),
}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooManySocketsActivated(n) => {
                write!(f, "expected at most one socket-activated listener, got {}", n)
            }
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ListenError {}

impl From<io::Error> for ListenError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// `Some(n)` if the process was launched with `n` inherited listening
/// sockets set up for it (systemd-style `LISTEN_PID`/`LISTEN_FDS`);
/// `None` if socket activation env vars are absent or stale.
fn inherited_socket_count() -> Option<usize> {
    let listen_pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if listen_pid != std::process::id() {
        return None;
    }
    std::env::var("LISTEN_FDS").ok()?.parse().ok()
}

/// Acquire the listening socket: adopt a socket-activated fd if the
/// environment names exactly one, otherwise bind fresh at `socket_path`.
pub fn acquire(socket_path: &Path) -> Result<UnixListener, ListenError> {
    if let Some(count) = inherited_socket_count() {
        if count != 1 {
            return Err(ListenError::TooManySocketsActivated(count));
        }
        log::info!("adopting socket-activated listener at fd {}", SD_LISTEN_FDS_START);
        // SAFETY: the supervising process (systemd or an equivalent
        // socket-activation launcher) guarantees fd 3 is an open,
        // already-bound, already-listening UnixListener when exactly
        // one socket was activated for us.
        let listener = unsafe { UnixListener::from_raw_fd(SD_LISTEN_FDS_START) };
        listener.set_nonblocking(true)?;
        return Ok(listener);
    }

    bind_path(socket_path)
}

fn bind_path(socket_path: &Path) -> Result<UnixListener, ListenError> {
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            use std::fs::DirBuilder;
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = DirBuilder::new();
            builder.mode(0o750).recursive(true);
            if let Err(e) = builder.create(parent) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    return Err(e.into());
                }
            }
        }
    }

    match std::fs::remove_file(socket_path) {
        Ok(()) => log::debug!("removed stale socket at {:?}", socket_path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    listener.set_nonblocking(true)?;
    log::info!("listening on {:?}", socket_path);
    Ok(listener)
}

/// Run the accept loop: one thread per accepted connection, until
/// `shutdown` is observed set. The listener is polled non-blocking so
/// the loop can check the flag between accepts, the way
/// `liana::bin::daemon::main` polls `handle.is_alive()`. On shutdown,
/// first every accepted connection's thread is joined, then every
/// still-registered VM session's pumps and supervisor are closed and
/// joined too, so `run` does not return until the whole process tree
/// it spawned has wound down.
pub fn run(
    listener: UnixListener,
    registry: Arc<VmRegistry>,
    config: Arc<Config>,
    shutdown: Arc<AtomicBool>,
) {
    let mut workers = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false).ok();
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                workers.push(thread::spawn(move || client::serve(stream, registry, config)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
        workers.retain(|h| !h.is_finished());
    }
    log::info!("listener shutting down, draining {} connections", workers.len());
    for handle in workers {
        let _ = handle.join();
    }

    let sessions = registry.snapshot();
    log::info!("waiting for {} VM session(s) to shut down", sessions.len());
    for vm in sessions {
        vm.shutdown_and_join();
    }
}

pub fn default_socket_path(config: &Config) -> PathBuf {
    config.resolved_socket_path()
}
