//! Decoding of `nginx.ingress.kubernetes.io/*` annotations into an [`IngressPolicy`]
//!
//! Every supported annotation is listed once in [`ANNOTATIONS`] together with the
//! setter that stores its decoded value. Decoding never fails: a value that does not
//! parse for its kind leaves the field unset, exactly like an absent annotation.

use serde::Serialize;
use std::collections::BTreeMap;

/// Prefix shared by every annotation this provider understands
pub const ANNOTATION_PREFIX: &str = "nginx.ingress.kubernetes.io/";

/// Typed view of an Ingress's annotations. `None` means "not annotated".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngressPolicy {
    // Authentication
    pub auth_type: Option<String>,
    pub auth_secret: Option<String>,
    pub auth_secret_type: Option<String>,
    pub auth_realm: Option<String>,
    pub auth_url: Option<String>,
    pub auth_response_headers: Option<Vec<String>>,

    // TLS behaviour
    pub force_ssl_redirect: Option<bool>,
    pub ssl_redirect: Option<bool>,
    pub ssl_passthrough: Option<bool>,
    pub proxy_ssl_secret: Option<String>,
    pub proxy_ssl_verify: Option<String>,
    pub proxy_ssl_name: Option<String>,
    pub proxy_ssl_server_name: Option<String>,

    // Routing
    pub use_regex: Option<bool>,
    pub backend_protocol: Option<String>,
    pub service_upstream: Option<bool>,

    // Session affinity
    pub affinity: Option<String>,
    pub session_cookie_name: Option<String>,
    pub session_cookie_path: Option<String>,
    pub session_cookie_domain: Option<String>,
    pub session_cookie_same_site: Option<String>,
    pub session_cookie_max_age: Option<i64>,
    pub session_cookie_secure: Option<bool>,

    // CORS
    pub enable_cors: Option<bool>,
    pub cors_allow_credentials: Option<bool>,
    pub cors_allow_headers: Option<Vec<String>>,
    pub cors_allow_methods: Option<Vec<String>>,
    pub cors_allow_origin: Option<Vec<String>>,
    pub cors_expose_headers: Option<Vec<String>>,
    pub cors_max_age: Option<i64>,

    // Rate limiting
    pub limit_rps: Option<i64>,
    pub limit_rpm: Option<i64>,
    pub limit_burst_multiplier: Option<i64>,

    // Buffering
    pub proxy_body_size: Option<String>,
    pub client_body_buffer_size: Option<String>,

    // Access control
    pub whitelist_source_range: Option<Vec<String>>,
}

/// The kind of value an annotation carries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationKind {
    String,
    Bool,
    Int,
    StringList,
}

/// Stores a decoded value into its policy field. The variant fixes the kind.
#[derive(Clone, Copy)]
pub enum Setter {
    String(fn(&mut IngressPolicy, String)),
    Bool(fn(&mut IngressPolicy, bool)),
    Int(fn(&mut IngressPolicy, i64)),
    StringList(fn(&mut IngressPolicy, Vec<String>)),
}

/// One row of the annotation table
#[derive(Clone, Copy)]
pub struct AnnotationField {
    /// Policy field name, for diagnostics
    pub field: &'static str,
    /// Full annotation key
    pub key: &'static str,
    pub setter: Setter,
}

impl AnnotationField {
    pub fn kind(&self) -> AnnotationKind {
        match self.setter {
            Setter::String(_) => AnnotationKind::String,
            Setter::Bool(_) => AnnotationKind::Bool,
            Setter::Int(_) => AnnotationKind::Int,
            Setter::StringList(_) => AnnotationKind::StringList,
        }
    }

    /// Decode `raw` for this field and store it. Malformed values are dropped.
    pub fn apply(&self, policy: &mut IngressPolicy, raw: &str) {
        match self.setter {
            Setter::String(set) => set(policy, raw.to_string()),
            Setter::Bool(set) => set(policy, parse_bool(raw)),
            Setter::Int(set) => {
                if let Some(value) = parse_int(raw) {
                    set(policy, value)
                }
            }
            Setter::StringList(set) => set(policy, parse_list(raw)),
        }
    }
}

macro_rules! annotation {
    ($field:ident, $key:literal, String) => {
        AnnotationField {
            field: stringify!($field),
            key: concat!("nginx.ingress.kubernetes.io/", $key),
            setter: Setter::String(|p: &mut IngressPolicy, v: String| p.$field = Some(v)),
        }
    };
    ($field:ident, $key:literal, Bool) => {
        AnnotationField {
            field: stringify!($field),
            key: concat!("nginx.ingress.kubernetes.io/", $key),
            setter: Setter::Bool(|p: &mut IngressPolicy, v: bool| p.$field = Some(v)),
        }
    };
    ($field:ident, $key:literal, Int) => {
        AnnotationField {
            field: stringify!($field),
            key: concat!("nginx.ingress.kubernetes.io/", $key),
            setter: Setter::Int(|p: &mut IngressPolicy, v: i64| p.$field = Some(v)),
        }
    };
    ($field:ident, $key:literal, StringList) => {
        AnnotationField {
            field: stringify!($field),
            key: concat!("nginx.ingress.kubernetes.io/", $key),
            setter: Setter::StringList(|p: &mut IngressPolicy, v: Vec<String>| p.$field = Some(v)),
        }
    };
}

/// Every annotation the provider decodes
pub static ANNOTATIONS: &[AnnotationField] = &[
    annotation!(auth_type, "auth-type", String),
    annotation!(auth_secret, "auth-secret", String),
    annotation!(auth_secret_type, "auth-secret-type", String),
    annotation!(auth_realm, "auth-realm", String),
    annotation!(auth_url, "auth-url", String),
    annotation!(auth_response_headers, "auth-response-headers", StringList),
    annotation!(force_ssl_redirect, "force-ssl-redirect", Bool),
    annotation!(ssl_redirect, "ssl-redirect", Bool),
    annotation!(ssl_passthrough, "ssl-passthrough", Bool),
    annotation!(proxy_ssl_secret, "proxy-ssl-secret", String),
    annotation!(proxy_ssl_verify, "proxy-ssl-verify", String),
    annotation!(proxy_ssl_name, "proxy-ssl-name", String),
    annotation!(proxy_ssl_server_name, "proxy-ssl-server-name", String),
    annotation!(use_regex, "use-regex", Bool),
    annotation!(backend_protocol, "backend-protocol", String),
    annotation!(service_upstream, "service-upstream", Bool),
    annotation!(affinity, "affinity", String),
    annotation!(session_cookie_name, "session-cookie-name", String),
    annotation!(session_cookie_path, "session-cookie-path", String),
    annotation!(session_cookie_domain, "session-cookie-domain", String),
    annotation!(session_cookie_same_site, "session-cookie-samesite", String),
    annotation!(session_cookie_max_age, "session-cookie-max-age", Int),
    annotation!(session_cookie_secure, "session-cookie-secure", Bool),
    annotation!(enable_cors, "enable-cors", Bool),
    annotation!(cors_allow_credentials, "cors-allow-credentials", Bool),
    annotation!(cors_allow_headers, "cors-allow-headers", StringList),
    annotation!(cors_allow_methods, "cors-allow-methods", StringList),
    annotation!(cors_allow_origin, "cors-allow-origin", StringList),
    annotation!(cors_expose_headers, "cors-expose-headers", StringList),
    annotation!(cors_max_age, "cors-max-age", Int),
    annotation!(limit_rps, "limit-rps", Int),
    annotation!(limit_rpm, "limit-rpm", Int),
    annotation!(limit_burst_multiplier, "limit-burst-multiplier", Int),
    annotation!(proxy_body_size, "proxy-body-size", String),
    annotation!(client_body_buffer_size, "client-body-buffer-size", String),
    annotation!(whitelist_source_range, "whitelist-source-range", StringList),
];

/// Decode an annotation map into a policy. Pure and total.
pub fn decode(annotations: &BTreeMap<String, String>) -> IngressPolicy {
    let mut policy = IngressPolicy::default();
    for field in ANNOTATIONS {
        if let Some(raw) = annotations.get(field.key) {
            field.apply(&mut policy, raw);
        }
    }
    policy
}

fn parse_bool(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("true")
}

fn parse_int(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ANNOTATION_PREFIX, k), v.to_string()))
            .collect()
    }

    #[test]
    fn test_absent_annotations_leave_fields_unset() {
        let policy = decode(&BTreeMap::new());
        assert_eq!(policy, IngressPolicy::default());
    }

    #[test]
    fn test_bool_is_case_insensitive() {
        let policy = decode(&annotations(&[
            ("ssl-passthrough", "TRUE"),
            ("ssl-redirect", "false"),
            ("use-regex", "yes"),
        ]));
        assert_eq!(policy.ssl_passthrough, Some(true));
        assert_eq!(policy.ssl_redirect, Some(false));
        // Anything but "true" decodes to false, not to unset
        assert_eq!(policy.use_regex, Some(false));
        assert_eq!(policy.force_ssl_redirect, None);
    }

    #[test]
    fn test_invalid_int_leaves_field_unset() {
        let policy = decode(&annotations(&[
            ("cors-max-age", "abc"),
            ("limit-rpm", "120"),
            ("session-cookie-max-age", " 10"),
        ]));
        assert_eq!(policy.cors_max_age, None);
        assert_eq!(policy.limit_rpm, Some(120));
        assert_eq!(policy.session_cookie_max_age, None);
    }

    #[test]
    fn test_string_list_is_trimmed() {
        let policy = decode(&annotations(&[(
            "cors-allow-methods",
            " GET , POST,,PUT ",
        )]));
        assert_eq!(
            policy.cors_allow_methods,
            Some(vec!["GET".to_string(), "POST".to_string(), "PUT".to_string()])
        );
    }

    #[test]
    fn test_unprefixed_keys_are_ignored() {
        let mut map = BTreeMap::new();
        map.insert("auth-type".to_string(), "basic".to_string());
        map.insert(
            "kubernetes.io/ingress.class".to_string(),
            "nginx".to_string(),
        );
        assert_eq!(decode(&map), IngressPolicy::default());
    }

    #[test]
    fn test_decode_is_idempotent() {
        let map = annotations(&[
            ("auth-type", "basic"),
            ("auth-secret", "default/users"),
            ("enable-cors", "true"),
            ("cors-allow-origin", "https://a.example, https://b.example"),
            ("limit-rps", "x"),
        ]);
        assert_eq!(decode(&map), decode(&map));
    }

    #[test]
    fn test_every_field_is_settable() {
        for field in ANNOTATIONS {
            let raw = match field.kind() {
                AnnotationKind::String => "value",
                AnnotationKind::Bool => "true",
                AnnotationKind::Int => "42",
                AnnotationKind::StringList => "a,b",
            };
            let mut policy = IngressPolicy::default();
            field.apply(&mut policy, raw);
            assert_ne!(
                policy,
                IngressPolicy::default(),
                "annotation {} did not set {}",
                field.key,
                field.field
            );
        }
    }

    #[test]
    fn test_table_keys_are_unique_and_prefixed() {
        let mut keys = HashSet::new();
        let mut fields = HashSet::new();
        for field in ANNOTATIONS {
            assert!(field.key.starts_with(ANNOTATION_PREFIX));
            assert!(keys.insert(field.key), "duplicate key {}", field.key);
            assert!(fields.insert(field.field), "duplicate field {}", field.field);
        }
    }
}
