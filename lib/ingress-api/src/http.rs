//! HTTP routing configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::middleware::Middleware;
use crate::tls::CertificatePair;

/// HTTP section of a snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,

    #[serde(default)]
    pub services: BTreeMap<String, Service>,

    #[serde(default)]
    pub middlewares: BTreeMap<String, Middleware>,

    #[serde(default)]
    pub servers_transports: BTreeMap<String, ServersTransport>,
}

impl HttpConfiguration {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
            && self.services.is_empty()
            && self.middlewares.is_empty()
            && self.servers_transports.is_empty()
    }
}

/// Matches requests by rule and hands them to a service through a middleware chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    /// Matcher expression, e.g. ``Host(`a.example.com`) && PathPrefix(`/`)``
    pub rule: String,

    /// Explicit priority; the engine derives one from the rule length when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Target service key
    pub service: String,

    /// Middleware keys, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,

    /// Present when the router only matches TLS connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

/// TLS designation of a router. Certificates come from the shared TLS store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {}

/// A load-balanced HTTP service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: ServersLoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersLoadBalancer {
    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,

    #[serde(default = "default_pass_host_header")]
    pub pass_host_header: bool,

    /// Key of the servers transport used to reach the servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_transport: Option<String>,
}

/// A single backend server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Server URL, e.g. `http://10.0.0.1:8080`
    pub url: String,

    /// Terminating-but-serving endpoint; only used when nothing else is left
    #[serde(default, skip_serializing_if = "is_false")]
    pub fenced: bool,
}

/// Session affinity for a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sticky {
    pub cookie: Cookie,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,

    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub http_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Max-Age in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
}

/// How the proxy talks TLS to backend servers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersTransport {
    /// SNI sent to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// PEM-encoded CA bundles trusted for backend certificates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_cas: Vec<String>,

    /// Client certificates presented to the backend
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<CertificatePair>,
}

fn default_pass_host_header() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}
