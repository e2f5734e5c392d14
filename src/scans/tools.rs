//! External tool invocation and argument validation.
//!
//! Scanner binaries are opaque subprocesses: `(targets, config) →
//! findings` over stdout. Arguments are validated before they reach a
//! command line (no shell is ever involved) and every invocation runs
//! under a per-tool timeout. A missing binary is not an error here;
//! handlers fall back to a pure-Rust path.

use std::path::PathBuf;
use std::process::Output;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rustc_hash::FxHashSet;
use tokio::process::Command;
use tracing::warn;

use super::ScanError;

pub const SUBFINDER_TIMEOUT: Duration = Duration::from_secs(300);
pub const NMAP_TIMEOUT: Duration = Duration::from_secs(120);
pub const NUCLEI_TIMEOUT: Duration = Duration::from_secs(600);
pub const XRAY_TIMEOUT: Duration = Duration::from_secs(300);
pub const GOWITNESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("domain regex")
});

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-./]+$").expect("template regex"));

static PLUGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-]+$").expect("plugin regex"));

const VALID_SEVERITIES: [&str; 5] = ["info", "low", "medium", "high", "critical"];

/// Plugins xray is allowed to run.
static VALID_XRAY_PLUGINS: LazyLock<FxHashSet<&'static str>> = LazyLock::new(|| {
    [
        "xss",
        "sqldet",
        "cmd-injection",
        "dirscan",
        "path-traversal",
        "xxe",
        "upload",
        "brute-force",
        "jsonp",
        "ssrf",
        "baseline",
        "redirect",
        "crlf-injection",
        "xstream",
        "struts",
    ]
    .into_iter()
    .collect()
});

/// Strict DNS-label check for domains handed to tools.
pub fn validate_domain(domain: &str) -> Result<(), ScanError> {
    if domain.len() <= 253 && DOMAIN_RE.is_match(domain) {
        Ok(())
    } else {
        Err(ScanError::InvalidConfig(format!(
            "invalid domain format: {domain}"
        )))
    }
}

/// Keep only recognized nuclei severities; an empty result falls back to
/// the default band.
pub fn validate_severity(severity: &str) -> String {
    let valid: Vec<&str> = severity
        .split(',')
        .map(|s| s.trim())
        .filter(|s| VALID_SEVERITIES.contains(&s.to_ascii_lowercase().as_str()))
        .collect();
    if valid.is_empty() {
        "medium,high,critical".to_string()
    } else {
        valid.join(",").to_ascii_lowercase()
    }
}

/// Template paths must be plain relative paths: word characters, dashes,
/// dots and slashes, with no `..` traversal.
pub fn validate_templates(templates: &[String]) -> Vec<String> {
    templates
        .iter()
        .filter(|t| TEMPLATE_RE.is_match(t) && !t.contains(".."))
        .cloned()
        .collect()
}

/// Plugins are drawn from a static allowlist.
pub fn validate_plugins(plugins: &[String]) -> Vec<String> {
    plugins
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| PLUGIN_RE.is_match(p) && VALID_XRAY_PLUGINS.contains(p.as_str()))
        .collect()
}

/// Locate a binary on `PATH`.
pub fn binary_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Run a tool with a hard timeout; stdout/stderr are captured.
pub async fn run_tool(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output, ScanError> {
    let future = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ScanError::Tool {
            tool: program.to_string(),
            message: e.to_string(),
        }),
        Err(_) => {
            warn!(tool = program, "tool execution timed out");
            Err(ScanError::Tool {
                tool: program.to_string(),
                message: format!("timed out after {}s", timeout.as_secs()),
            })
        }
    }
}

/// Guess a service name from a well-known port.
pub fn guess_service(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        6379 => "redis",
        8080 => "http-proxy",
        8443 => "https-alt",
        _ => "unknown",
    }
}
