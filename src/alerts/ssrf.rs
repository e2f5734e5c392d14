//! SSRF guard for outbound notification targets.
//!
//! Rejects any URL whose host is a reserved name, or whose resolved
//! addresses fall in private, loopback, link-local, or otherwise
//! non-public space, before any network I/O is issued against it.

use std::net::IpAddr;

use tokio::net::lookup_host;
use url::Url;

/// Hostname suffixes that never leave the local network.
const BLOCKED_SUFFIXES: [&str; 3] = [".local", ".internal", ".localhost"];

/// `Ok(url)` when the target is safe to contact; `Err(reason)` otherwise.
pub async fn is_safe_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(format!("scheme {scheme:?} is not allowed"));
    }

    let Some(host) = url.host_str() else {
        return Err("URL has no host".to_string());
    };
    let host_lower = host.to_ascii_lowercase();
    let host_trimmed = host_lower.trim_matches(['[', ']']);

    if host_trimmed == "localhost"
        || host_trimmed == "0.0.0.0"
        || host_trimmed == "::1"
        || host_trimmed.starts_with("127.")
    {
        return Err(format!("host {host:?} is reserved"));
    }
    if BLOCKED_SUFFIXES.iter().any(|s| host_lower.ends_with(s)) {
        return Err(format!("host {host:?} has a blocked suffix"));
    }

    if let Ok(addr) = host_trimmed.parse::<IpAddr>() {
        if !ip_is_public(addr) {
            return Err(format!("address {addr} is not publicly routable"));
        }
        return Ok(url);
    }

    // Resolve and check every address; a name that cannot resolve is not
    // a reachable notification target either way.
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = lookup_host((host_trimmed, port))
        .await
        .map_err(|e| format!("host {host:?} did not resolve: {e}"))?;
    let mut any = false;
    for addr in addrs {
        any = true;
        if !ip_is_public(addr.ip()) {
            return Err(format!(
                "host {host:?} resolves to non-public address {}",
                addr.ip()
            ));
        }
    }
    if !any {
        return Err(format!("host {host:?} did not resolve"));
    }
    Ok(url)
}

/// Publicly routable check covering loopback, RFC1918, link-local,
/// CGN, unspecified, multicast, and reserved space.
pub fn ip_is_public(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_documentation()
                // 100.64.0.0/10 carrier-grade NAT
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                // 0.0.0.0/8
                || octets[0] == 0
                // 240.0.0.0/4 reserved
                || octets[0] >= 240)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_is_public(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn blocked(url: &str) -> bool {
        is_safe_url(url).await.is_err()
    }

    #[tokio::test]
    async fn rejects_reserved_hostnames() {
        assert!(blocked("http://localhost/hook").await);
        assert!(blocked("http://127.0.0.1/").await);
        assert!(blocked("http://127.1.2.3:8080/x").await);
        assert!(blocked("http://0.0.0.0/").await);
        assert!(blocked("http://[::1]/").await);
    }

    #[tokio::test]
    async fn rejects_blocked_suffixes() {
        assert!(blocked("http://foo.internal/hook").await);
        assert!(blocked("http://printer.local/").await);
        assert!(blocked("http://svc.localhost/").await);
    }

    #[tokio::test]
    async fn rejects_private_and_special_literals() {
        assert!(blocked("http://10.0.0.5/").await);
        assert!(blocked("http://172.16.0.1/").await);
        assert!(blocked("http://192.168.1.1/").await);
        assert!(blocked("http://169.254.169.254/latest/meta-data").await);
        assert!(blocked("http://100.64.0.1/").await);
        assert!(blocked("http://240.0.0.1/").await);
        assert!(blocked("http://[fe80::1]/").await);
        assert!(blocked("http://[fd00::1]/").await);
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        assert!(blocked("ftp://example.com/").await);
        assert!(blocked("file:///etc/passwd").await);
        assert!(blocked("gopher://example.com/").await);
    }

    #[tokio::test]
    async fn accepts_public_literals() {
        assert!(is_safe_url("https://1.1.1.1/hook").await.is_ok());
        assert!(is_safe_url("http://8.8.8.8:8080/x").await.is_ok());
    }

    #[test]
    fn public_ip_classifier() {
        assert!(ip_is_public("1.1.1.1".parse().expect("ip")));
        assert!(!ip_is_public("10.1.2.3".parse().expect("ip")));
        assert!(!ip_is_public("::ffff:192.168.0.1".parse().expect("ip")));
        assert!(ip_is_public("2606:4700:4700::1111".parse().expect("ip")));
    }
}
