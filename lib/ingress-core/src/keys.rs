//! Generated names for configuration entries
//!
//! Namespaces are DNS labels and never contain `.`, so the first `.` in a key always
//! separates the namespace from the rest. Numeric suffixes are appended last and can
//! be parsed back from the right, which keeps every key unique for a distinct input.

pub const DEFAULT_BACKEND: &str = "default-backend";
pub const DEFAULT_BACKEND_TLS: &str = "default-backend-tls";

/// Router for one path of one rule of an Ingress
pub fn router(namespace: &str, ingress: &str, rule: usize, path: usize) -> String {
    format!("{}.{}-rule-{}-path-{}", namespace, ingress, rule, path)
}

/// TCP router for a passthrough rule
pub fn passthrough_router(namespace: &str, ingress: &str, rule: usize) -> String {
    format!("{}.{}-rule-{}-passthrough", namespace, ingress, rule)
}

/// Service for a Service port, referenced by number or by name
pub fn service(namespace: &str, service: &str, port: &str) -> String {
    format!("{}.{}.{}", namespace, service, port)
}

/// Servers transport of an Ingress
pub fn servers_transport(namespace: &str, ingress: &str) -> String {
    format!("{}.{}", namespace, ingress)
}

/// TLS certificate loaded from a Secret
pub fn certificate(namespace: &str, secret: &str) -> String {
    format!("{}.{}", namespace, secret)
}

/// Middleware attached to a router, e.g. `<router>-basic-auth`
pub fn middleware(router: &str, kind: &str) -> String {
    format!("{}-{}", router, kind)
}

/// Plain-HTTP sibling of a TLS router
pub fn http_sibling(router: &str) -> String {
    format!("{}-http", router)
}

/// Redirect-only companion of a router
pub fn redirect_router(router: &str) -> String {
    format!("{}-redirect", router)
}
