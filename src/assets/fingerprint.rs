//! Stable, project-scoped dedup keys.
//!
//! Every observation row carries a `fingerprint_hash`: the 32-hex-char
//! truncated SHA-256 of `"{project_id}:{kind}:{normalized_value}"`.
//! Hashes are scoped by project on purpose: the same subdomain observed
//! in two projects produces two distinct fingerprints, so rows are never
//! merged across tenants.

use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

/// Truncated SHA-256 over `"{project_id}:{kind}:{value}"`, 32 hex chars.
pub fn fingerprint_hash(project_id: Uuid, kind: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{project_id}:{kind}:{value}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

/// Fingerprint for a subdomain observation (value lowercased + trimmed).
pub fn subdomain_fingerprint(project_id: Uuid, subdomain: &str) -> String {
    fingerprint_hash(project_id, "subdomain", subdomain.trim().to_lowercase().as_str())
}

/// Fingerprint for an IP observation.
pub fn ip_fingerprint(project_id: Uuid, ip: &str) -> String {
    fingerprint_hash(project_id, "ip", ip.trim())
}

/// Fingerprint for a web asset, keyed by the normalized URL.
pub fn url_fingerprint(project_id: Uuid, url: &str) -> String {
    fingerprint_hash(project_id, "url", &normalize_url(url))
}

/// Fingerprint for a vulnerability: normalized target URL + template id.
pub fn vuln_fingerprint(project_id: Uuid, target_url: &str, template_id: &str) -> String {
    let normalized = if target_url.is_empty() {
        String::new()
    } else {
        normalize_url(target_url)
    };
    fingerprint_hash(project_id, "vuln", &format!("{normalized}:{template_id}"))
}

/// 16-hex-char truncated SHA-256 used to aggregate related alerts.
pub fn aggregation_key(
    project_id: Uuid,
    target_type: &str,
    severity: &str,
    alert_type: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{project_id}:{target_type}:{severity}:{alert_type}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Normalize a URL for fingerprinting and natural-key comparison.
///
/// Lowercases scheme and host, strips scheme-default ports (`:80` for
/// http, `:443` for https), strips the trailing `/` from non-root paths,
/// and drops query and fragment. A missing scheme defaults to `http`.
///
/// Normalization is idempotent:
///
/// ```
/// use recongraph::assets::normalize_url;
///
/// let n = normalize_url("HTTP://Example.COM:80/path/");
/// assert_eq!(n, "http://example.com/path");
/// assert_eq!(normalize_url(&n), n);
/// ```
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "http:///".to_string();
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let parsed = match Url::parse(&with_scheme) {
        Ok(u) => u,
        // Unparseable input falls back to a lowercased trim so the
        // fingerprint is still deterministic.
        Err(_) => return trimmed.to_lowercase(),
    };

    let scheme = parsed.scheme().to_lowercase();
    let host = parsed.host_str().unwrap_or_default().to_lowercase();

    // Url::port() already yields None for scheme-default ports.
    let port = match parsed.port() {
        Some(p) => format!(":{p}"),
        None => String::new(),
    };

    let path = parsed.path();
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        "/"
    };
    let path = if path.is_empty() { "/" } else { path };

    format!("{scheme}://{host}{port}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_default_ports() {
        assert_eq!(
            normalize_url("http://example.com:80/"),
            "http://example.com/"
        );
        assert_eq!(
            normalize_url("https://example.com:443/login"),
            "https://example.com/login"
        );
        // Non-default ports survive.
        assert_eq!(
            normalize_url("https://example.com:8443/login"),
            "https://example.com:8443/login"
        );
        // :80 on https is not a default port.
        assert_eq!(
            normalize_url("https://example.com:80/"),
            "https://example.com:80/"
        );
    }

    #[test]
    fn normalize_lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTPS://API.Example.Com/Case/Sensitive"),
            "https://api.example.com/Case/Sensitive"
        );
    }

    #[test]
    fn normalize_keeps_root_slash_only() {
        assert_eq!(normalize_url("http://example.com"), "http://example.com/");
        assert_eq!(
            normalize_url("http://example.com/a/b/"),
            "http://example.com/a/b"
        );
    }

    #[test]
    fn normalize_defaults_scheme() {
        assert_eq!(
            normalize_url("example.com/path"),
            "http://example.com/path"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "HTTP://Example.COM:80/x/",
            "https://a.b.c:8443",
            "example.com",
            "http://example.com/?q=1#frag",
        ] {
            let once = normalize_url(raw);
            assert_eq!(normalize_url(&once), once, "input: {raw}");
        }
    }

    #[test]
    fn fingerprints_are_project_scoped() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let a = subdomain_fingerprint(p1, "www.example.com");
        let b = subdomain_fingerprint(p2, "www.example.com");
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprints_are_stable_and_case_folded() {
        let p = Uuid::new_v4();
        assert_eq!(
            subdomain_fingerprint(p, "WWW.Example.Com "),
            subdomain_fingerprint(p, "www.example.com")
        );
        assert_eq!(
            url_fingerprint(p, "http://example.com:80/a/"),
            url_fingerprint(p, "http://example.com/a")
        );
    }

    #[test]
    fn aggregation_key_shape() {
        let key = aggregation_key(Uuid::new_v4(), "vulnerability", "critical", "vuln_found");
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
