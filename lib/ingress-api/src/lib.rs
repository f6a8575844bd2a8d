//! Dynamic routing configuration produced by the Ingress provider
//!
//! This library defines the snapshot the provider publishes for the proxy engine:
//! - HTTP routers, services, middlewares and servers transports
//! - TCP routers and services (TLS passthrough)
//! - TLS certificates loaded from Secrets
//!
//! All collections are ordered maps keyed by generated names, so two equal
//! snapshots always serialize to the same bytes.

pub mod http;
pub mod middleware;
pub mod tcp;
pub mod tls;

use serde::{Deserialize, Serialize};

pub use http::{
    Cookie, HttpConfiguration, Router, RouterTls, Server, ServersLoadBalancer, ServersTransport,
    Service, Sticky,
};
pub use middleware::{
    BasicAuth, Buffering, Cors, DigestAuth, ForwardAuth, IpAllowList, Middleware, RateLimit,
    RedirectScheme,
};
pub use tcp::{TcpConfiguration, TcpRouter, TcpRouterTls, TcpServer, TcpServersLoadBalancer, TcpService};
pub use tls::{CertificatePair, TlsConfiguration};

/// Name of the internal service that answers nothing; used by redirect-only routers
pub const NOOP_SERVICE: &str = "noop@internal";

/// A complete routing configuration snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfiguration {
    /// HTTP routing
    #[serde(default)]
    pub http: HttpConfiguration,

    /// TCP routing (SNI passthrough)
    #[serde(default)]
    pub tcp: TcpConfiguration,

    /// TLS material
    #[serde(default)]
    pub tls: TlsConfiguration,
}

impl DynamicConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the snapshot routes nothing
    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.tcp.is_empty() && self.tls.is_empty()
    }
}
