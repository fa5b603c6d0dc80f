//! vprox — a long-lived proxy daemon that multiplexes multiple untrusted
//! clients' command and I/O streams onto a single in-guest agent running
//! inside a lightweight hypervisor.
//!
//! A client speaks a length-prefixed JSON RPC (see [`rpc`]) over a Unix
//! domain socket (see [`listener`]). `hello` registers a VM ([`registry`],
//! [`vm`]); `allocateIO` hands the client a private file descriptor (see
//! [`fdpass`]) wired through to the guest's I/O channel.

pub mod client;
pub mod codec;
pub mod config;
pub mod fdpass;
pub mod listener;
pub mod registry;
pub mod rpc;
pub mod vm;

use std::fmt;

/// Crate version, as reported in logs at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the RPC protocol, returned in `hello`/`attach` responses.
pub const RPC_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A panic in any thread should bring down the whole daemon rather than
/// silently wedge a pump. We print a backtrace the way the stdlib's default
/// hook does not (yet) give us programmatic access to.
pub fn setup_panic_hook() {
    std::panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info
            .location()
            .map(|l| l.file())
            .unwrap_or("'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());
        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!(
            "panic occurred at line {} of file {}: {:?}\n{:?}",
            line,
            file,
            info,
            bt
        );
    }));
}
