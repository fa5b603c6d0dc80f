//! End-to-end scenarios from the data model's testable-properties
//! section, driven over real Unix sockets. A `tests/common`-style fake
//! guest stands in for the hypervisor side of the ctl/io channels, the
//! way `lianad/tests` drives a spawned daemon against a regtest node —
//! here the "external guest" is a `UnixListener` in the test process
//! itself, since a real hypervisor isn't available in CI.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vprox::client;
use vprox::codec::{self, read_frame, write_frame, ProtocolError};
use vprox::config::Config;
use vprox::fdpass::recv_fd;
use vprox::registry::VmRegistry;
use vprox::vm::iomsg::{read_io_message, write_io_message};

/// Bind fake ctl/io "guest" sockets and keep accepting connections on a
/// background thread, handing back the accepted streams through a
/// channel so the test can read/write on the guest side.
struct FakeGuest {
    ctl_path: std::path::PathBuf,
    io_path: std::path::PathBuf,
    io_accepted: std::sync::mpsc::Receiver<UnixStream>,
}

fn spawn_fake_guest(dir: &Path) -> FakeGuest {
    let ctl_path = dir.join("ctl");
    let io_path = dir.join("io");
    let ctl_listener = UnixListener::bind(&ctl_path).unwrap();
    let io_listener = UnixListener::bind(&io_path).unwrap();

    thread::spawn(move || {
        // Answer the READY handshake on each accepted ctl connection,
        // then hold it open for the test's lifetime; the core never
        // writes on it again unless a test issues 'hyper'.
        let mut held = Vec::new();
        for conn in ctl_listener.incoming() {
            if let Ok(mut conn) = conn {
                if read_frame(&mut conn, codec::MAX_FRAME_LEN).is_ok() {
                    let response = serde_json::json!({"success": true});
                    let _ = write_frame(&mut conn, &serde_json::to_vec(&response).unwrap());
                }
                held.push(conn);
            } else {
                break;
            }
        }
        drop(held);
    });

    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        for conn in io_listener.incoming() {
            match conn {
                Ok(conn) => {
                    if tx.send(conn).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    FakeGuest {
        ctl_path,
        io_path,
        io_accepted: rx,
    }
}

fn spawn_client_conn(registry: Arc<VmRegistry>, config: Arc<Config>) -> UnixStream {
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    thread::spawn(move || client::serve(server_stream, registry, config));
    client_stream
}

fn send(stream: &mut UnixStream, payload: &serde_json::Value) {
    write_frame(stream, &serde_json::to_vec(payload).unwrap()).unwrap();
}

fn recv(stream: &mut UnixStream) -> serde_json::Value {
    let frame = read_frame(stream, codec::MAX_FRAME_LEN).unwrap();
    serde_json::from_slice(&frame.payload).unwrap()
}

#[test]
fn hello_then_bye_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut conn,
        &serde_json::json!({
            "id": "hello",
            "data": {
                "containerId": "c1",
                "ctlSerial": guest.ctl_path,
                "ioSerial": guest.io_path,
            }
        }),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
    assert_eq!(resp["data"]["version"], serde_json::json!(1));

    send(
        &mut conn,
        &serde_json::json!({"id": "bye", "data": {"containerId": "c1"}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
}

#[test]
fn duplicate_hello_is_rejected_and_connection_stays_open() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    let hello = serde_json::json!({
        "id": "hello",
        "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
    });
    send(&mut conn, &hello);
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));

    send(&mut conn, &hello);
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(false));
    assert_eq!(
        resp["error"],
        serde_json::json!("c1: container already registered")
    );

    // The connection must still be usable.
    send(
        &mut conn,
        &serde_json::json!({"id": "bye", "data": {"containerId": "c1"}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
}

#[test]
fn unknown_id_closes_the_connection() {
    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(registry, config);

    send(&mut conn, &serde_json::json!({"id": "nope"}));
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(false));
    assert_eq!(resp["error"], serde_json::json!("no payload named 'nope'"));

    // The server must have closed its end: a further read observes EOF.
    match read_frame(&mut conn, codec::MAX_FRAME_LEN) {
        Err(ProtocolError::ShortRead) => {}
        other => panic!("expected connection to be closed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn missing_id_closes_the_connection() {
    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(registry, config);

    send(&mut conn, &serde_json::json!({"foo": "bar"}));
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(false));
    assert_eq!(resp["error"], serde_json::json!("no 'id' field in request"));

    match read_frame(&mut conn, codec::MAX_FRAME_LEN) {
        Err(ProtocolError::ShortRead) => {}
        other => panic!("expected connection to be closed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn malformed_payload_closes_the_connection_without_a_response() {
    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(registry, config);

    write_frame(&mut conn, b"sekjewr").unwrap();

    match read_frame(&mut conn, codec::MAX_FRAME_LEN) {
        Err(ProtocolError::ShortRead) => {}
        other => panic!("expected EOF with no response frame, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn allocate_io_hands_back_a_working_fd_tagged_with_the_right_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut conn,
        &serde_json::json!({
            "id": "hello",
            "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
        }),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));

    let mut guest_io = guest
        .io_accepted
        .recv_timeout(Duration::from_secs(5))
        .expect("core should have connected to the fake guest io channel");

    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 2}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
    assert_eq!(resp["data"]["ioBase"], serde_json::json!(1));

    let fd = recv_fd(&conn).expect("fd must follow the response frame");
    let mut client_io: UnixStream = fd.into();

    write_io_message(&mut client_io, 1, b"hello from stdin").unwrap();
    let msg = read_io_message(&mut guest_io).unwrap();
    assert_eq!(msg.sequence, 1);
    assert_eq!(msg.payload, b"hello from stdin");

    // A second allocation with nStreams=1 continues the monotone
    // counter from io_base + n_streams of the first.
    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 1}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
    assert_eq!(resp["data"]["ioBase"], serde_json::json!(3));
    let _second_fd = recv_fd(&conn).unwrap();
}

#[test]
fn allocate_io_rejects_out_of_range_stream_counts() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut conn,
        &serde_json::json!({
            "id": "hello",
            "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
        }),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(true));

    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 0}}),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(false));

    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 3}}),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(false));
}

#[test]
fn allocate_io_and_hyper_before_a_bound_vm_fail_without_closing() {
    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(registry, config);

    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 1}}),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(false));

    send(
        &mut conn,
        &serde_json::json!({"id": "hyper", "data": {"hyperName": "ping"}}),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(false));

    // Still open: a well-formed request after the failures succeeds.
    send(&mut conn, &serde_json::json!({"id": "bye", "data": {"containerId": "nope"}}));
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(false));
}

#[test]
fn attach_binds_a_second_client_to_the_same_vm() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut owner = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut owner,
        &serde_json::json!({
            "id": "hello",
            "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
        }),
    );
    assert_eq!(recv(&mut owner)["success"], serde_json::json!(true));

    let mut second = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));
    send(
        &mut second,
        &serde_json::json!({"id": "attach", "data": {"containerId": "c1"}}),
    );
    let resp = recv(&mut second);
    assert_eq!(resp["success"], serde_json::json!(true));
    assert_eq!(resp["data"]["version"], serde_json::json!(1));
}

#[test]
fn client_disconnect_tears_down_its_io_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut conn,
        &serde_json::json!({
            "id": "hello",
            "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
        }),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(true));

    let _guest_io = guest
        .io_accepted
        .recv_timeout(Duration::from_secs(5))
        .expect("core should have connected to the fake guest io channel");

    send(
        &mut conn,
        &serde_json::json!({"id": "allocateIO", "data": {"nStreams": 1}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(true));
    let fd = recv_fd(&conn).expect("fd must follow the response frame");
    let client_io: UnixStream = fd.into();

    // Dropping the RPC connection (not the io fd handed to the
    // "guest-side process") must still tear the session down: the
    // client's io fd will observe EOF even though nobody closed it
    // directly.
    drop(conn);
    thread::sleep(Duration::from_millis(200));

    let mut buf = [0u8; 1];
    use std::io::Read;
    let n = client_io
        .try_clone()
        .unwrap()
        .read(&mut buf)
        .unwrap_or(0);
    assert_eq!(n, 0, "client io end should observe EOF once its owning client disconnects");
}

#[test]
fn guest_io_loss_drives_the_vm_to_destroyed_via_vm_lost() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_fake_guest(dir.path());

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(Arc::clone(&registry), Arc::clone(&config));

    send(
        &mut conn,
        &serde_json::json!({
            "id": "hello",
            "data": {"containerId": "c1", "ctlSerial": guest.ctl_path, "ioSerial": guest.io_path}
        }),
    );
    assert_eq!(recv(&mut conn)["success"], serde_json::json!(true));

    let guest_io = guest
        .io_accepted
        .recv_timeout(Duration::from_secs(5))
        .expect("core should have connected to the fake guest io channel");

    let vm = registry.get("c1").expect("vm should still be registered");
    assert_eq!(vm.state(), vprox::vm::VmState::Connected);

    // Simulate the guest vanishing: closing its end of the io channel
    // makes the io->clients pump observe EOF, which fires `vm_lost` and
    // lets the supervisor thread drive Connected -> Lost -> Destroyed.
    drop(guest_io);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while vm.state() != vprox::vm::VmState::Destroyed {
        assert!(
            std::time::Instant::now() < deadline,
            "VM session never reached Destroyed after guest io loss"
        );
        thread::sleep(Duration::from_millis(20));
    }

    // A resource-level failure after the VM is lost is a negative
    // response, not a connection-closing protocol error.
    send(
        &mut conn,
        &serde_json::json!({"id": "hyper", "data": {"hyperName": "ping"}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(false));
    assert_eq!(resp["error"], serde_json::json!("VM session has been lost"));
}

#[test]
fn attach_to_an_unregistered_container_fails() {
    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(Config::default());
    let mut conn = spawn_client_conn(registry, config);

    send(
        &mut conn,
        &serde_json::json!({"id": "attach", "data": {"containerId": "ghost"}}),
    );
    let resp = recv(&mut conn);
    assert_eq!(resp["success"], serde_json::json!(false));
}
