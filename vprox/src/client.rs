//! Per-accepted-connection state and the dispatcher serve loop.
//!
//! One thread per accepted connection. The loop is intentionally not
//! pipelined: one frame in, one frame out, in request order.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::{self, ProtocolError};
use crate::config::Config;
use crate::fdpass;
use crate::registry::VmRegistry;
use crate::rpc::{self, Response};
use crate::vm::VmSession;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A connected peer: at most one bound VM at a time. Binding is
/// cleared on `bye`/disconnect; the VM itself is unaffected.
pub struct Client {
    pub id: u64,
    bound_vm: Option<Arc<VmSession>>,
    /// I/O sessions this client obtained via `allocateIO`, each with the
    /// VM it was allocated on: an `IoSession` is torn down when its
    /// owning client disconnects, independent of whether that client is
    /// still bound to the same VM at the time.
    owned_io: Vec<(Arc<VmSession>, u64)>,
}

impl Client {
    pub fn new(id: u64) -> Self {
        Client {
            id,
            bound_vm: None,
            owned_io: Vec::new(),
        }
    }

    /// Allocate the next process-unique client id.
    pub fn next_id() -> u64 {
        NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn bind(&mut self, vm: Arc<VmSession>) {
        self.bound_vm = Some(vm);
    }

    pub fn bound_vm(&self) -> Option<&Arc<VmSession>> {
        self.bound_vm.as_ref()
    }

    /// Clear the binding if it currently points at `container_id`;
    /// called by `bye` so that unpublishing a VM this client itself
    /// registered also drops its own reference to it.
    pub fn unbind_if(&mut self, container_id: &str) {
        if self
            .bound_vm
            .as_ref()
            .is_some_and(|vm| vm.container_id == container_id)
        {
            self.bound_vm = None;
        }
    }

    /// Record a successful `allocateIO` so its session is torn down when
    /// this client disconnects.
    pub fn record_io(&mut self, vm: Arc<VmSession>, io_base: u64) {
        self.owned_io.push((vm, io_base));
    }

    /// Tear down every I/O session this client ever allocated. Called
    /// once, when the connection's serve loop exits.
    fn destroy_owned_io(&mut self) {
        for (vm, io_base) in self.owned_io.drain(..) {
            vm.destroy_io_session(io_base);
        }
    }
}

/// Serve one accepted connection until EOF or a protocol error.
/// Malformed frames, missing `id`, and unknown `id` terminate the
/// connection; state and resource errors do not.
pub fn serve(mut stream: UnixStream, registry: Arc<VmRegistry>, config: Arc<Config>) {
    let client_id = Client::next_id();
    let mut client = Client::new(client_id);
    log::info!("client {}: connected", client_id);

    loop {
        let frame = match codec::read_frame(&mut stream, config.max_frame_len) {
            Ok(frame) => frame,
            Err(ProtocolError::ShortRead) => {
                log::debug!("client {}: disconnected", client_id);
                break;
            }
            Err(e) => {
                log::warn!("client {}: frame read failed: {}", client_id, e);
                break;
            }
        };

        let req = match rpc::parse_request(&frame.payload) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("client {}: {}, closing connection", client_id, e);
                break;
            }
        };

        let outcome = rpc::dispatch(req, &mut client, &registry, &config);

        if let Err(e) = write_response(&mut stream, &outcome.response) {
            log::warn!("client {}: writing response failed: {}", client_id, e);
            break;
        }

        if let Some(fd) = outcome.fd_to_send {
            use std::os::fd::AsRawFd;
            if let Err(e) = fdpass::send_fd(&stream, fd.as_raw_fd()) {
                log::warn!("client {}: sending fd failed: {}", client_id, e);
                break;
            }
        }

        if outcome.close {
            log::debug!("client {}: protocol error, closing connection", client_id);
            break;
        }
    }

    if let Some(vm) = client.bound_vm.take() {
        log::debug!(
            "client {}: disconnected, unbinding from '{}'",
            client_id,
            vm.container_id
        );
    }
    client.destroy_owned_io();
    log::info!("client {}: connection closed", client_id);
}

fn write_response(stream: &mut UnixStream, response: &Response) -> Result<(), ProtocolError> {
    let bytes = serde_json::to_vec(response).expect("Response serialization cannot fail");
    codec::write_frame(stream, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotone_and_unique() {
        let a = Client::next_id();
        let b = Client::next_id();
        assert!(b > a);
    }

    #[test]
    fn unbind_if_only_clears_matching_container() {
        let vm = VmSession::new(
            "c1".to_string(),
            "/nonexistent/ctl".into(),
            "/nonexistent/io".into(),
            None,
            codec::MAX_FRAME_LEN,
        );
        let mut client = Client::new(1);
        client.bind(vm);
        client.unbind_if("other");
        assert!(client.bound_vm().is_some());
        client.unbind_if("c1");
        assert!(client.bound_vm().is_none());
    }
}
