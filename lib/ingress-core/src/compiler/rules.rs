//! Router rule expressions for Ingress hosts and paths

/// Rule matching every request
pub const MATCH_ALL: &str = "PathPrefix(`/`)";

const PATH_TYPE_EXACT: &str = "Exact";

/// Build the rule for a host/path pair. Both parts are optional; an empty rule
/// matches everything.
pub fn build_rule(host: Option<&str>, path: Option<&str>, path_type: &str, use_regex: bool) -> String {
    let mut matchers = Vec::new();

    if let Some(host) = host.filter(|h| !h.is_empty()) {
        matchers.push(host_matcher(host));
    }

    if let Some(path) = path.filter(|p| !p.is_empty()) {
        matchers.push(path_matcher(path, path_type, use_regex));
    }

    if matchers.is_empty() {
        return MATCH_ALL.to_string();
    }
    matchers.join(" && ")
}

/// `*.example.com` matches exactly one extra leading label
pub fn host_matcher(host: &str) -> String {
    match wildcard_pattern(host) {
        Some(pattern) => format!("HostRegexp(`{}`)", pattern),
        None => format!("Host(`{}`)", host),
    }
}

fn wildcard_pattern(host: &str) -> Option<String> {
    let rest = host.strip_prefix("*.")?;
    Some(format!("^[a-zA-Z0-9-]+\\.{}$", regex::escape(rest)))
}

/// `Exact` matches the path only; everything else (`Prefix`, `ImplementationSpecific`,
/// unset) is a prefix match, as a regex when `use_regex` is set.
pub fn path_matcher(path: &str, path_type: &str, use_regex: bool) -> String {
    if path_type == PATH_TYPE_EXACT {
        return format!("Path(`{}`)", path);
    }
    if use_regex {
        return format!("PathRegexp(`^{}`)", path);
    }
    strict_prefix(path)
}

/// Prefix match on whole path segments: `/abc` matches `/abc`, `/abc/` and `/abc/def`
/// but not `/abcd`. `/` matches everything.
pub fn strict_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return MATCH_ALL.to_string();
    }
    format!("(Path(`{0}`) || PathPrefix(`{0}/`))", trimmed)
}

/// TCP rule for SNI-based passthrough. Wildcard hosts match like [`host_matcher`].
pub fn host_sni(host: &str) -> String {
    match wildcard_pattern(host) {
        Some(pattern) => format!("HostSNIRegexp(`{}`)", pattern),
        None => format!("HostSNI(`{}`)", host),
    }
}
