//! JavaScript endpoint extraction and API risk classification.
//!
//! Pulls script references out of HTML, then mines script bodies for API
//! endpoints (axios calls, fetch calls, and generic path literals).
//! Endpoints with template interpolation are discarded: a dynamic path
//! is noise, not an asset.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::types::Severity;

static SCRIPT_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<script[^>]*\bsrc=['"]([^'"]+)['"][^>]*>\s*</script>"#)
        .expect("script src regex")
});

// The regex crate has no lookahead; match every script tag and filter
// src-bearing ones in code.
static SCRIPT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script([^>]*)>(.*?)</script>").expect("script tag regex")
});

static AXIOS_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)axios\.(get|post|put|patch|delete)\(\s*['"`]([^'"`]+)['"`]"#)
        .expect("axios regex")
});

static FETCH_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)fetch\(\s*['"`]([^'"`]+)['"`]\s*(?:,\s*\{([^}]*)\})?"#)
        .expect("fetch regex")
});

static GENERIC_ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)['"`](https?://[^'"`\s]+|/(?:api|graphql|rest|v\d+)[^'"`\s]*)['"`]"#)
        .expect("generic endpoint regex")
});

static METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)method\s*:\s*['"`]([a-zA-Z]+)['"`]"#).expect("method regex")
});

/// A script block discovered in a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptRef {
    /// `external` or `inline`.
    pub script_type: &'static str,
    pub script_url: String,
    /// Inline body; external scripts are fetched by the caller.
    pub content: Option<String>,
}

/// An endpoint mined from a script body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointRef {
    pub method: String,
    pub endpoint: String,
    pub evidence: String,
}

/// A static risk classification for an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointRisk {
    pub rule_name: &'static str,
    pub severity: Severity,
    pub title: &'static str,
    pub description: &'static str,
    pub risk_tags: Vec<&'static str>,
}

/// Extract external and inline script blocks from HTML. External `src`
/// values resolve against the page URL; inline blocks are keyed
/// `page#inline-N`.
pub fn extract_scripts_from_html(html: &str, page_url: &str) -> Vec<ScriptRef> {
    let mut scripts = Vec::new();

    for captures in SCRIPT_SRC_RE.captures_iter(html) {
        let Some(src) = captures.get(1).map(|m| m.as_str().trim()) else {
            continue;
        };
        if src.is_empty() {
            continue;
        }
        let resolved = Url::parse(page_url)
            .and_then(|base| base.join(src))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| src.to_string());
        scripts.push(ScriptRef {
            script_type: "external",
            script_url: resolved,
            content: None,
        });
    }

    let mut inline_index = 0usize;
    for captures in SCRIPT_TAG_RE.captures_iter(html) {
        let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if attrs.to_ascii_lowercase().contains("src=") {
            continue;
        }
        let Some(body) = captures.get(2).map(|m| m.as_str().trim()) else {
            continue;
        };
        if body.is_empty() {
            continue;
        }
        scripts.push(ScriptRef {
            script_type: "inline",
            script_url: format!("{page_url}#inline-{inline_index}"),
            content: Some(body.to_string()),
        });
        inline_index += 1;
    }

    scripts
}

/// Normalize an endpoint literal; `None` discards it.
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return None;
    }
    if endpoint.contains("${") || endpoint.contains("{{") {
        return None;
    }
    if let Some(rest) = endpoint.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") || endpoint.starts_with('/')
    {
        return Some(endpoint.to_string());
    }
    if endpoint.starts_with("api/") {
        return Some(format!("/{endpoint}"));
    }
    None
}

fn evidence_window(content: &str, start: usize, end: usize) -> String {
    const RADIUS: usize = 50;
    let left = start.saturating_sub(RADIUS);
    let right = (end + RADIUS).min(content.len());
    // Snap to char boundaries; the windows are only evidence snippets.
    let mut left = left;
    while left > 0 && !content.is_char_boundary(left) {
        left -= 1;
    }
    let mut right = right;
    while right < content.len() && !content.is_char_boundary(right) {
        right += 1;
    }
    content[left..right].replace('\n', " ").trim().to_string()
}

/// Extract API endpoints from a script body, deduplicated by
/// `(endpoint, method)` and sorted for stable output. Explicit axios /
/// fetch calls win over generic string-literal matches.
pub fn extract_endpoints_from_js(content: &str) -> Vec<EndpointRef> {
    let mut findings: BTreeMap<(String, String), EndpointRef> = BTreeMap::new();

    for captures in AXIOS_CALL_RE.captures_iter(content) {
        let (Some(method), Some(raw)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let Some(endpoint) = normalize_endpoint(raw.as_str()) else {
            continue;
        };
        let method = method.as_str().to_ascii_uppercase();
        let full = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        findings.insert(
            (endpoint.clone(), method.clone()),
            EndpointRef {
                method,
                endpoint,
                evidence: evidence_window(content, full.0, full.1),
            },
        );
    }

    for captures in FETCH_CALL_RE.captures_iter(content) {
        let Some(raw) = captures.get(1) else { continue };
        let Some(endpoint) = normalize_endpoint(raw.as_str()) else {
            continue;
        };
        let method = captures
            .get(2)
            .and_then(|options| METHOD_RE.captures(options.as_str()))
            .and_then(|m| m.get(1))
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_else(|| "GET".to_string());
        let full = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        findings.insert(
            (endpoint.clone(), method.clone()),
            EndpointRef {
                method,
                endpoint,
                evidence: evidence_window(content, full.0, full.1),
            },
        );
    }

    for captures in GENERIC_ENDPOINT_RE.captures_iter(content) {
        let Some(raw) = captures.get(1) else { continue };
        let Some(endpoint) = normalize_endpoint(raw.as_str()) else {
            continue;
        };
        let key = (endpoint.clone(), "GET".to_string());
        if findings.contains_key(&key) {
            continue;
        }
        let full = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        findings.insert(
            key,
            EndpointRef {
                method: "GET".to_string(),
                endpoint,
                evidence: evidence_window(content, full.0, full.1),
            },
        );
    }

    findings.into_values().collect()
}

/// Lightweight static rules flagging risky endpoint shapes.
pub fn classify_endpoint_risks(endpoint: &str, method: &str) -> Vec<EndpointRisk> {
    let method = method.to_ascii_uppercase();
    let lowered = endpoint.to_ascii_lowercase();
    let mut risks = Vec::new();

    if lowered.starts_with("http://") {
        risks.push(EndpointRisk {
            rule_name: "insecure_transport",
            severity: Severity::Medium,
            title: "Insecure API transport over HTTP",
            description: "Endpoint uses HTTP and may be exposed to MITM.",
            risk_tags: vec!["transport", "http"],
        });
    }

    let sensitive_markers = ["/admin", "/internal", "/debug", "/actuator"];
    if sensitive_markers.iter().any(|m| lowered.contains(m)) {
        risks.push(EndpointRisk {
            rule_name: "sensitive_api_surface",
            severity: Severity::High,
            title: "Sensitive management endpoint exposed in frontend JS",
            description: "Endpoint path indicates management/debug interfaces.",
            risk_tags: vec!["exposure", "management"],
        });
    }

    let mutation_markers = ["/admin", "/internal", "/config", "/system"];
    if matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
        && mutation_markers.iter().any(|m| lowered.contains(m))
    {
        risks.push(EndpointRisk {
            rule_name: "mutation_on_sensitive_surface",
            severity: Severity::High,
            title: "State-changing operation on sensitive endpoint",
            description: "Mutating methods on sensitive API paths need strict auth controls.",
            risk_tags: vec!["authz", "mutation"],
        });
    }

    if lowered.contains("/graphql") {
        risks.push(EndpointRisk {
            rule_name: "graphql_surface",
            severity: Severity::Low,
            title: "GraphQL endpoint exposed",
            description: "GraphQL endpoints should enforce query depth and auth checks.",
            risk_tags: vec!["graphql"],
        });
    }

    risks
}

/// Host portion of an absolute endpoint URL.
pub fn extract_host(endpoint: &str) -> Option<String> {
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return None;
    }
    Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_external_and_inline_scripts() {
        let html = r#"
            <html><head>
            <script src="/static/app.js"></script>
            <script>fetch('/api/inline');</script>
            <script src="https://cdn.example.com/lib.js"></script>
            </head></html>
        "#;
        let scripts = extract_scripts_from_html(html, "https://example.com/page");
        assert_eq!(scripts.len(), 3);
        assert_eq!(scripts[0].script_type, "external");
        assert_eq!(scripts[0].script_url, "https://example.com/static/app.js");
        assert_eq!(scripts[1].script_url, "https://cdn.example.com/lib.js");
        assert_eq!(scripts[2].script_type, "inline");
        assert_eq!(
            scripts[2].script_url,
            "https://example.com/page#inline-0"
        );
        assert!(scripts[2].content.as_deref().unwrap_or("").contains("/api/inline"));
    }

    #[test]
    fn extracts_axios_and_fetch_endpoints() {
        let js = r#"
            axios.post('/api/users', body);
            fetch('/api/orders', { method: 'DELETE' });
            fetch('/api/items');
            const url = "/api/search";
        "#;
        let endpoints = extract_endpoints_from_js(js);
        let pairs: Vec<(&str, &str)> = endpoints
            .iter()
            .map(|e| (e.endpoint.as_str(), e.method.as_str()))
            .collect();
        assert!(pairs.contains(&("/api/users", "POST")));
        assert!(pairs.contains(&("/api/orders", "DELETE")));
        assert!(pairs.contains(&("/api/items", "GET")));
        assert!(pairs.contains(&("/api/search", "GET")));
    }

    #[test]
    fn drops_template_literals() {
        let js = "axios.get(`/api/users/${id}`); fetch('/api/{{path}}');";
        assert!(extract_endpoints_from_js(js).is_empty());
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(
            normalize_endpoint("//cdn.example.com/api"),
            Some("https://cdn.example.com/api".to_string())
        );
        assert_eq!(normalize_endpoint("api/v1/users"), Some("/api/v1/users".to_string()));
        assert_eq!(normalize_endpoint("relative/path"), None);
        assert_eq!(normalize_endpoint(""), None);
    }

    #[test]
    fn risk_rules_fire_on_shape() {
        let risks = classify_endpoint_risks("http://example.com/admin/config", "POST");
        let names: Vec<&str> = risks.iter().map(|r| r.rule_name).collect();
        assert!(names.contains(&"insecure_transport"));
        assert!(names.contains(&"sensitive_api_surface"));
        assert!(names.contains(&"mutation_on_sensitive_surface"));

        let benign = classify_endpoint_risks("https://example.com/api/health", "GET");
        assert!(benign.is_empty());
    }

    #[test]
    fn graphql_rule() {
        let risks = classify_endpoint_risks("https://example.com/graphql", "POST");
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].rule_name, "graphql_surface");
        assert_eq!(risks[0].severity, Severity::Low);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            extract_host("https://api.example.com/v1"),
            Some("api.example.com".to_string())
        );
        assert_eq!(extract_host("/api/v1"), None);
    }
}
