//! Resolved backend addresses
use serde::{Deserialize, Serialize};

/// A network address backing a service port
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendAddress {
    /// `host:port`, with IPv6 hosts bracketed
    pub address: String,
    /// Terminating but still serving; routed to only as a fallback
    pub fenced: bool,
}

impl BackendAddress {
    pub fn new(host: &str, port: i32) -> Self {
        Self {
            address: join_host_port(host, port),
            fenced: false,
        }
    }

    pub fn fenced(mut self, fenced: bool) -> Self {
        self.fenced = fenced;
        self
    }
}

/// Join a host and a port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: i32) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
