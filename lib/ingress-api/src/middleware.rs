//! Middleware definitions attached to HTTP routers

use serde::{Deserialize, Serialize};

/// A router middleware. Serialized externally tagged, e.g. `{"basicAuth": {...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    BasicAuth(BasicAuth),
    DigestAuth(DigestAuth),
    ForwardAuth(ForwardAuth),
    Headers(Cors),
    IpAllowList(IpAllowList),
    RateLimit(RateLimit),
    Buffering(Buffering),
    RedirectScheme(RedirectScheme),
}

impl Middleware {
    /// Short kind name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Middleware::BasicAuth(_) => "basicAuth",
            Middleware::DigestAuth(_) => "digestAuth",
            Middleware::ForwardAuth(_) => "forwardAuth",
            Middleware::Headers(_) => "headers",
            Middleware::IpAllowList(_) => "ipAllowList",
            Middleware::RateLimit(_) => "rateLimit",
            Middleware::Buffering(_) => "buffering",
            Middleware::RedirectScheme(_) => "redirectScheme",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// `user:hash` credential lines
    pub users: Vec<String>,
    pub realm: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestAuth {
    /// `user:realm:hash` credential lines
    pub users: Vec<String>,
    pub realm: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
    pub address: String,

    /// Headers copied from the auth response into the forwarded request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_response_headers: Vec<String>,
}

/// CORS response headers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cors {
    #[serde(default)]
    pub access_control_allow_credentials: bool,

    #[serde(default)]
    pub access_control_allow_headers: Vec<String>,

    #[serde(default)]
    pub access_control_allow_methods: Vec<String>,

    #[serde(default)]
    pub access_control_allow_origin_list: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_control_expose_headers: Vec<String>,

    /// Preflight cache duration in seconds
    #[serde(default)]
    pub access_control_max_age: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllowList {
    /// CIDRs or single IPs allowed to reach the router
    pub source_range: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Requests allowed per period
    pub average: i64,

    /// Period in seconds
    pub period_seconds: u64,

    pub burst: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffering {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_body_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_request_body_bytes: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectScheme {
    pub scheme: String,

    #[serde(default)]
    pub permanent: bool,
}
