//! Background pump threads: each copies framed messages between two
//! endpoints and exits cleanly when either side closes.

use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::vm::iomsg::{read_io_message, write_io_message};
use crate::vm::VmSession;

/// Reads I/O messages from the guest's io channel, looks up the owning
/// session by sequence number, and rewrites the message onto that
/// client's socketpair end. Unknown sequence numbers are logged and
/// skipped — a client may have disconnected after the guest queued
/// output for it. A read error or EOF fires `vm_lost` and exits.
pub fn io_to_clients_pump(vm: Arc<VmSession>, mut guest_io: UnixStream) {
    log::info!("{}: io->clients pump started", vm.container_id);
    loop {
        let msg = match read_io_message(&mut guest_io) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("{}: io channel read failed: {}", vm.container_id, e);
                break;
            }
        };
        let session = vm.find_session(msg.sequence);
        match session {
            Some(session) => {
                let mut host_end = match session.host_end.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!(
                            "{}: cloning session socket failed: {}",
                            vm.container_id,
                            e
                        );
                        continue;
                    }
                };
                if let Err(e) = write_io_message(&mut host_end, msg.sequence, &msg.payload) {
                    log::warn!(
                        "{}: forwarding to client for sequence {} failed: {}",
                        vm.container_id,
                        msg.sequence,
                        e
                    );
                }
            }
            None => {
                log::debug!(
                    "{}: no session for sequence {}, dropping message",
                    vm.container_id,
                    msg.sequence
                );
            }
        }
    }
    vm.on_guest_lost();
    log::info!("{}: io->clients pump exited", vm.container_id);
}

/// Reads framed I/O messages from a single client's socketpair end,
/// verifies the sequence number equals the session's `io_base` (this is
/// how stdin is distinguished from stdout even when they share a base),
/// and forwards the message onto the guest's io channel. Exits on
/// client EOF or a sequence mismatch, closing the session end.
pub fn client_to_io_pump(
    vm: Arc<VmSession>,
    io_base: u64,
    mut session_end: UnixStream,
    mut guest_io: UnixStream,
) {
    log::info!(
        "{}: client->io pump started for base {}",
        vm.container_id,
        io_base
    );
    loop {
        let msg = match read_io_message(&mut session_end) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!(
                    "{}: client->io pump for base {} ending: {}",
                    vm.container_id,
                    io_base,
                    e
                );
                break;
            }
        };
        if msg.sequence != io_base {
            log::warn!(
                "{}: client wrote sequence {} on session with base {}, closing",
                vm.container_id,
                msg.sequence,
                io_base
            );
            break;
        }
        if let Err(e) = write_io_message(&mut guest_io, msg.sequence, &msg.payload) {
            log::error!(
                "{}: forwarding client input to guest failed: {}",
                vm.container_id,
                e
            );
            break;
        }
    }
    let _ = session_end.shutdown(std::net::Shutdown::Both);
    log::info!(
        "{}: client->io pump exited for base {}",
        vm.container_id,
        io_base
    );
}

/// Reads newline-delimited console output and emits it as log records.
/// Exits on EOF.
pub fn console_pump(vm: Arc<VmSession>, console: UnixStream) {
    log::info!("{}: console pump started", vm.container_id);
    let mut reader = BufReader::new(console);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => log::info!("{}: console: {}", vm.container_id, line.trim_end()),
            Err(e) => {
                log::warn!("{}: console read failed: {}", vm.container_id, e);
                break;
            }
        }
    }
    log::info!("{}: console pump exited", vm.container_id);
}
