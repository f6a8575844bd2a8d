//! Middlewares derived from an Ingress policy
//!
//! Builders return the middleware together with its generated key. Each one is
//! optional; an annotated but unusable value is an error for the router it belongs to.

use crate::annotations::IngressPolicy;
use crate::keys;
use crate::store::ResourceStore;
use crate::{CoreError, Result};
use ingress_api::{
    BasicAuth, Buffering, Cors, DigestAuth, DynamicConfiguration, ForwardAuth, IpAllowList,
    Middleware, RateLimit, RedirectScheme, Router, RouterTls, NOOP_SERVICE,
};
use k8s_openapi::api::core::v1::Secret;
use tracing::warn;

pub const DEFAULT_AUTH_REALM: &str = "Authentication Required";
const AUTH_FILE_KEY: &str = "auth";
const DEFAULT_BURST_MULTIPLIER: i64 = 5;

const DEFAULT_CORS_METHODS: &[&str] = &["GET", "PUT", "POST", "DELETE", "PATCH", "OPTIONS"];
const DEFAULT_CORS_HEADERS: &[&str] = &[
    "DNT",
    "Keep-Alive",
    "User-Agent",
    "X-Requested-With",
    "If-Modified-Since",
    "Cache-Control",
    "Content-Type",
    "Range",
    "Authorization",
];
const DEFAULT_CORS_MAX_AGE: i64 = 1_728_000;

pub type Keyed = (String, Middleware);

/// Split `namespace/name`, defaulting to `namespace` when the reference has no slash
pub fn split_reference<'a>(reference: &'a str, namespace: &'a str) -> (&'a str, &'a str) {
    reference.split_once('/').unwrap_or((namespace, reference))
}

/// Basic or digest authentication backed by a Secret
pub async fn auth(
    store: &dyn ResourceStore,
    namespace: &str,
    router: &str,
    policy: &IngressPolicy,
) -> Result<Option<Keyed>> {
    let Some(auth_type) = policy.auth_type.as_deref() else {
        return Ok(None);
    };

    let digest = match auth_type.to_ascii_lowercase().as_str() {
        "basic" => false,
        "digest" => true,
        other => {
            return Err(CoreError::InvalidPolicy(format!(
                "invalid auth-type {:?}, expected basic or digest",
                other
            )))
        }
    };

    let reference = policy.auth_secret.as_deref().unwrap_or_default().trim();
    if reference.is_empty() {
        return Err(CoreError::InvalidPolicy(
            "auth-secret is required with auth-type".to_string(),
        ));
    }

    let (secret_namespace, secret_name) = split_reference(reference, namespace);
    let secret = store
        .get_secret(secret_namespace, secret_name)
        .await?
        .ok_or_else(|| CoreError::SecretNotFound(format!("{}/{}", secret_namespace, secret_name)))?;

    let users = match policy.auth_secret_type.as_deref().unwrap_or("auth-file") {
        "auth-file" => users_from_file(&secret)?,
        "auth-map" => users_from_map(&secret),
        other => {
            return Err(CoreError::InvalidPolicy(format!(
                "invalid auth-secret-type {:?}, expected auth-file or auth-map",
                other
            )))
        }
    };

    if users.is_empty() {
        return Err(CoreError::InvalidPolicy(format!(
            "secret {}/{} holds no credentials",
            secret_namespace, secret_name
        )));
    }

    let realm = policy
        .auth_realm
        .clone()
        .unwrap_or_else(|| DEFAULT_AUTH_REALM.to_string());

    Ok(Some(if digest {
        (
            keys::middleware(router, "digest-auth"),
            Middleware::DigestAuth(DigestAuth { users, realm }),
        )
    } else {
        (
            keys::middleware(router, "basic-auth"),
            Middleware::BasicAuth(BasicAuth { users, realm }),
        )
    }))
}

/// One credential per non-empty line of the `auth` key
fn users_from_file(secret: &Secret) -> Result<Vec<String>> {
    let content = secret
        .data
        .as_ref()
        .and_then(|data| data.get(AUTH_FILE_KEY))
        .ok_or_else(|| {
            CoreError::InvalidPolicy(format!("auth secret has no {:?} key", AUTH_FILE_KEY))
        })?;

    Ok(String::from_utf8_lossy(&content.0)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// One `user:hash` credential per data entry, ordered by user
fn users_from_map(secret: &Secret) -> Vec<String> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(user, hash)| format!("{}:{}", user, String::from_utf8_lossy(&hash.0).trim()))
        .collect()
}

pub fn forward_auth(router: &str, policy: &IngressPolicy) -> Result<Option<Keyed>> {
    let Some(url) = policy.auth_url.as_deref() else {
        return Ok(None);
    };
    if url.trim().is_empty() {
        return Err(CoreError::InvalidPolicy("auth-url is empty".to_string()));
    }

    Ok(Some((
        keys::middleware(router, "forward-auth"),
        Middleware::ForwardAuth(ForwardAuth {
            address: url.trim().to_string(),
            auth_response_headers: policy.auth_response_headers.clone().unwrap_or_default(),
        }),
    )))
}

pub fn cors(router: &str, policy: &IngressPolicy) -> Option<Keyed> {
    if !policy.enable_cors.unwrap_or(false) {
        return None;
    }

    let or_default = |value: &Option<Vec<String>>, default: &[&str]| {
        value
            .clone()
            .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
    };

    Some((
        keys::middleware(router, "cors"),
        Middleware::Headers(Cors {
            access_control_allow_credentials: policy.cors_allow_credentials.unwrap_or(true),
            access_control_allow_headers: or_default(&policy.cors_allow_headers, DEFAULT_CORS_HEADERS),
            access_control_allow_methods: or_default(&policy.cors_allow_methods, DEFAULT_CORS_METHODS),
            access_control_allow_origin_list: or_default(&policy.cors_allow_origin, &["*"]),
            access_control_expose_headers: policy.cors_expose_headers.clone().unwrap_or_default(),
            access_control_max_age: policy.cors_max_age.unwrap_or(DEFAULT_CORS_MAX_AGE),
        }),
    ))
}

pub fn allow_list(router: &str, policy: &IngressPolicy) -> Option<Keyed> {
    let ranges = policy.whitelist_source_range.clone().filter(|r| !r.is_empty())?;
    Some((
        keys::middleware(router, "allowlist"),
        Middleware::IpAllowList(IpAllowList {
            source_range: ranges,
        }),
    ))
}

/// `limit-rps` wins over `limit-rpm`
pub fn rate_limit(router: &str, policy: &IngressPolicy) -> Option<Keyed> {
    let (average, period_seconds) = match (policy.limit_rps, policy.limit_rpm) {
        (Some(rps), _) if rps > 0 => (rps, 1),
        (_, Some(rpm)) if rpm > 0 => (rpm, 60),
        _ => return None,
    };
    let multiplier = policy
        .limit_burst_multiplier
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_BURST_MULTIPLIER);

    Some((
        keys::middleware(router, "rate-limit"),
        Middleware::RateLimit(RateLimit {
            average,
            period_seconds,
            burst: average.saturating_mul(multiplier),
        }),
    ))
}

pub fn buffering(router: &str, policy: &IngressPolicy) -> Option<Keyed> {
    let max = size_annotation(router, "proxy-body-size", &policy.proxy_body_size);
    let mem = size_annotation(router, "client-body-buffer-size", &policy.client_body_buffer_size);
    if max.is_none() && mem.is_none() {
        return None;
    }

    Some((
        keys::middleware(router, "buffering"),
        Middleware::Buffering(Buffering {
            max_request_body_bytes: max,
            mem_request_body_bytes: mem,
        }),
    ))
}

fn size_annotation(router: &str, name: &str, value: &Option<String>) -> Option<u64> {
    let raw = value.as_deref()?;
    let size = parse_size(raw);
    if size.is_none() {
        warn!("Ignoring {} {:?} on router {}: not a size", name, raw, router);
    }
    size.filter(|s| *s > 0)
}

/// nginx size syntax: bytes, or a `k`/`m`/`g` suffixed count
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 1024),
        'm' | 'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' | 'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Decide between a plain-HTTP sibling and an HTTPS redirect for `router`.
///
/// The redirect router reuses the rule and middlewares of `router` and always ends
/// with the redirect-scheme middleware.
pub fn apply_ssl_redirect(
    key: &str,
    router: &mut Router,
    policy: &IngressPolicy,
    has_tls: bool,
    fragment: &mut DynamicConfiguration,
) {
    let force = policy.force_ssl_redirect.unwrap_or(false);
    let redirect = policy.ssl_redirect.unwrap_or(has_tls);

    if !force && !redirect {
        if has_tls {
            fragment.http.routers.insert(
                keys::http_sibling(key),
                Router {
                    tls: None,
                    ..router.clone()
                },
            );
        }
        return;
    }

    let middleware_key = keys::middleware(key, "redirect-scheme");
    fragment.http.middlewares.insert(
        middleware_key.clone(),
        Middleware::RedirectScheme(RedirectScheme {
            scheme: "https".to_string(),
            permanent: true,
        }),
    );

    let mut middlewares = router.middlewares.clone();
    middlewares.push(middleware_key);
    fragment.http.routers.insert(
        keys::redirect_router(key),
        Router {
            rule: router.rule.clone(),
            priority: router.priority,
            service: NOOP_SERVICE.to_string(),
            middlewares,
            tls: None,
        },
    );

    router.tls.get_or_insert_with(RouterTls::default);
}
