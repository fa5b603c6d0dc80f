//! Request/response wire types and the `match`-based RPC dispatch.
//!
//! A single `match` on the request's `id` rather than a runtime
//! registry of closures. The envelope is `{"id": string, "data":
//! value?}` in, `{"success": bool, "error": string?, "data": object?}`
//! out.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::Client;
use crate::config::Config;
use crate::registry::{RegistryError, VmRegistry};
use crate::vm::VmSession;
use crate::RPC_VERSION;

#[derive(Debug, Clone, Deserialize)]
pub struct RawRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Response {
    pub fn ok(data: Option<Map<String, Value>>) -> Self {
        Response {
            success: true,
            error: None,
            data,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

/// Returned by every dispatch path: the response frame to write, and
/// whether the connection must be closed after writing it.
pub struct DispatchOutcome {
    pub response: Response,
    pub close: bool,
    /// Set only by a successful `allocateIO`: the caller must send
    /// this descriptor via [`crate::fdpass::send_fd`] immediately after
    /// writing the response frame, before reading another frame.
    pub fd_to_send: Option<OwnedFd>,
}

impl DispatchOutcome {
    fn ok(response: Response) -> Self {
        DispatchOutcome {
            response,
            close: false,
            fd_to_send: None,
        }
    }

    fn closing(response: Response) -> Self {
        DispatchOutcome {
            response,
            close: true,
            fd_to_send: None,
        }
    }
}

#[derive(Debug)]
pub enum ParseError {
    MalformedJson(serde_json::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedJson(e) => write!(f, "malformed request payload: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a frame's payload bytes as a [`RawRequest`]. A malformed
/// payload is not a protocol error with a response; the caller closes
/// the connection without writing a frame.
pub fn parse_request(payload: &[u8]) -> Result<RawRequest, ParseError> {
    serde_json::from_slice(payload).map_err(ParseError::MalformedJson)
}

fn field_str<'a>(data: &'a Value, name: &str) -> Option<&'a str> {
    data.get(name).and_then(|v| v.as_str())
}

fn handle_hello(
    data: Option<Value>,
    client: &mut Client,
    registry: &VmRegistry,
    config: &Config,
) -> Result<Map<String, Value>, String> {
    let data = data.ok_or_else(|| "missing request data".to_string())?;
    let container_id = field_str(&data, "containerId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'containerId' field".to_string())?
        .to_string();
    let ctl_serial = field_str(&data, "ctlSerial")
        .ok_or_else(|| "missing 'ctlSerial' field".to_string())?
        .to_string();
    let io_serial = field_str(&data, "ioSerial")
        .ok_or_else(|| "missing 'ioSerial' field".to_string())?
        .to_string();
    let console = field_str(&data, "console").map(String::from);

    let vm = VmSession::new(
        container_id.clone(),
        ctl_serial.into(),
        io_serial.into(),
        console.map(Into::into),
        config.max_frame_len,
    );
    registry
        .insert_new_or_fail(Arc::clone(&vm))
        .map_err(|e| match e {
            RegistryError::AlreadyRegistered(id) => format!("{}: container already registered", id),
            RegistryError::NotFound(id) => format!("{}: no such container", id),
        })?;

    if let Err(e) = vm.connect(config.console_dump) {
        registry.remove(&container_id);
        return Err(format!("{}: failed to connect to guest: {}", container_id, e));
    }

    client.bind(Arc::clone(&vm));

    let mut out = Map::new();
    out.insert("version".to_string(), Value::from(RPC_VERSION));
    Ok(out)
}

fn handle_attach(
    data: Option<Value>,
    client: &mut Client,
    registry: &VmRegistry,
) -> Result<Map<String, Value>, String> {
    let data = data.ok_or_else(|| "missing request data".to_string())?;
    let container_id = field_str(&data, "containerId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'containerId' field".to_string())?;
    let vm = registry
        .get(container_id)
        .ok_or_else(|| format!("{}: no such container", container_id))?;
    client.bind(vm);

    let mut out = Map::new();
    out.insert("version".to_string(), Value::from(RPC_VERSION));
    Ok(out)
}

fn handle_bye(data: Option<Value>, client: &mut Client, registry: &VmRegistry) -> Result<(), String> {
    let data = data.ok_or_else(|| "missing request data".to_string())?;
    let container_id = field_str(&data, "containerId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'containerId' field".to_string())?;
    if registry.remove(container_id).is_none() {
        return Err(format!("{}: no such container", container_id));
    }
    client.unbind_if(container_id);
    Ok(())
}

fn handle_allocate_io(
    data: Option<Value>,
    client: &mut Client,
) -> Result<(Map<String, Value>, OwnedFd), String> {
    let data = data.ok_or_else(|| "missing request data".to_string())?;
    let n_streams = data
        .get("nStreams")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "missing 'nStreams' field".to_string())?;
    let vm = client
        .bound_vm()
        .ok_or_else(|| "no bound VM; call 'hello' or 'attach' first".to_string())?
        .clone();
    if !(1..=2).contains(&n_streams) {
        return Err(format!("invalid nStreams {}, must be 1 or 2", n_streams));
    }
    let (io_base, fd) = vm
        .allocate_io(n_streams as u8, client.id)
        .map_err(|e| e.to_string())?;
    client.record_io(vm, io_base);

    let mut out = Map::new();
    out.insert("ioBase".to_string(), Value::from(io_base));
    Ok((out, fd))
}

fn handle_hyper(data: Option<Value>, client: &Client) -> Result<Map<String, Value>, String> {
    let data = data.ok_or_else(|| "missing request data".to_string())?;
    let hyper_name = field_str(&data, "hyperName")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'hyperName' field".to_string())?
        .to_string();
    let vm = client
        .bound_vm()
        .ok_or_else(|| "no bound VM; call 'hello' or 'attach' first".to_string())?;
    let guest_data = data.get("data").cloned();
    let result = vm
        .send_ctl(&hyper_name, guest_data)
        .map_err(|e| e.to_string())?;

    match result {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => {
            let mut out = Map::new();
            out.insert("result".to_string(), other);
            Ok(out)
        }
    }
}

/// Dispatch one already-framed, already-parsed request. Protocol-level
/// failures (missing/unknown `id`) close the connection after the
/// response is written; all other failures are ordinary negative
/// responses that keep the connection open.
pub fn dispatch(
    req: RawRequest,
    client: &mut Client,
    registry: &VmRegistry,
    config: &Config,
) -> DispatchOutcome {
    let id = match req.id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => {
            return DispatchOutcome::closing(Response::err("no 'id' field in request"));
        }
    };

    log::debug!("client {}: dispatching '{}'", client.id, id);

    match id {
        "hello" => match handle_hello(req.data, client, registry, config) {
            Ok(data) => DispatchOutcome::ok(Response::ok(Some(data))),
            Err(e) => {
                log::warn!("client {}: hello failed: {}", client.id, e);
                DispatchOutcome::ok(Response::err(e))
            }
        },
        "attach" => match handle_attach(req.data, client, registry) {
            Ok(data) => DispatchOutcome::ok(Response::ok(Some(data))),
            Err(e) => {
                log::warn!("client {}: attach failed: {}", client.id, e);
                DispatchOutcome::ok(Response::err(e))
            }
        },
        "bye" => match handle_bye(req.data, client, registry) {
            Ok(()) => DispatchOutcome::ok(Response::ok(None)),
            Err(e) => {
                log::warn!("client {}: bye failed: {}", client.id, e);
                DispatchOutcome::ok(Response::err(e))
            }
        },
        "allocateIO" => match handle_allocate_io(req.data, client) {
            Ok((data, fd)) => DispatchOutcome {
                response: Response::ok(Some(data)),
                close: false,
                fd_to_send: Some(fd),
            },
            Err(e) => {
                log::warn!("client {}: allocateIO failed: {}", client.id, e);
                DispatchOutcome::ok(Response::err(e))
            }
        },
        "hyper" => match handle_hyper(req.data, client) {
            Ok(data) => DispatchOutcome::ok(Response::ok(Some(data))),
            Err(e) => {
                log::warn!("client {}: hyper failed: {}", client.id, e);
                DispatchOutcome::ok(Response::err(e))
            }
        },
        other => {
            DispatchOutcome::closing(Response::err(format!("no payload named '{}'", other)))
        }
    }
}
