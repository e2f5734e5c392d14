//! HTTP probing of open ports into web assets.
//!
//! Prefers the `httpx` CLI for its richer JSON output; the fallback is a
//! plain reqwest probe.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::store::assets::WebAssetPatch;
use crate::store::models::ScanTask;
use crate::util::{json_bool, json_i64};

use super::tools::{HTTP_PROBE_TIMEOUT, binary_on_path, run_tool};
use super::{ScanContext, ScanError};

const HTTP_PORTS: [u16; 4] = [80, 443, 8080, 8443];

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<title>([^<]+)</title>").expect("title regex"));

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 500);
    let verify_tls = ctx.settings.scan_verify_tls && !json_bool(&task.config, "insecure", false);

    let ips = ctx.store.list_ip_addresses(task.project_id, batch_size).await?;
    let mut probed = 0u64;
    let mut alive = 0u64;

    for ip in &ips {
        let ports = ctx.store.list_ports_by_ip(ip.id, 100).await?;
        let http_ports: Vec<_> = ports
            .iter()
            .filter(|p| {
                HTTP_PORTS.contains(&p.port)
                    || matches!(p.service.as_deref(), Some("http") | Some("https"))
            })
            .collect();

        for port in http_ports {
            let scheme = if matches!(port.port, 443 | 8443) {
                "https"
            } else {
                "http"
            };
            let url = format!("{scheme}://{}:{}", ip.ip, port.port);

            let mut patch = probe_url(&url, verify_tls).await;
            patch.ip_id = Some(ip.id);
            patch.port_id = Some(port.id);
            if patch.is_alive == Some(true) {
                alive += 1;
            }
            ctx.store.upsert_web_asset(task.project_id, &url, patch).await?;
            probed += 1;
        }
    }

    info!(probed, alive, "http probe finished");
    Ok(json!({ "urls_probed": probed, "alive": alive }))
}

/// Probe one URL into a web-asset patch. Never errors: a dead endpoint
/// is an observation, not a failure.
pub(crate) async fn probe_url(url: &str, verify_tls: bool) -> WebAssetPatch {
    if binary_on_path("httpx").is_some() {
        if let Some(patch) = probe_with_httpx(url, verify_tls).await {
            return patch;
        }
    }
    probe_with_reqwest(url, verify_tls).await
}

async fn probe_with_httpx(url: &str, verify_tls: bool) -> Option<WebAssetPatch> {
    let mut args = vec!["-u", url, "-json", "-silent", "-timeout", "10"];
    if !verify_tls {
        args.push("-insecure");
    }
    let output = run_tool("httpx", &args, HTTP_PROBE_TIMEOUT * 3).await.ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let data: Value = serde_json::from_str(stdout.trim()).ok()?;

    Some(WebAssetPatch {
        title: data.get("title").and_then(Value::as_str).map(String::from),
        status_code: data
            .get("status_code")
            .and_then(Value::as_u64)
            .map(|c| c as u16),
        content_length: data.get("content_length").and_then(Value::as_i64),
        content_type: data
            .get("content_type")
            .and_then(Value::as_str)
            .map(String::from),
        server: data
            .get("webserver")
            .and_then(Value::as_str)
            .map(String::from),
        technologies: data.get("tech").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        }),
        is_alive: Some(true),
        ..WebAssetPatch::default()
    })
}

async fn probe_with_reqwest(url: &str, verify_tls: bool) -> WebAssetPatch {
    let client = match reqwest::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .danger_accept_invalid_certs(!verify_tls)
        .user_agent("EASM-Scanner/1.0")
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "probe client build failed");
            return WebAssetPatch {
                is_alive: Some(false),
                ..WebAssetPatch::default()
            };
        }
    };

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url, error = %e, "probe request failed");
            return WebAssetPatch {
                is_alive: Some(false),
                ..WebAssetPatch::default()
            };
        }
    };

    let status = response.status().as_u16();
    let server = response
        .headers()
        .get(reqwest::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let content_length = response.content_length().map(|l| l as i64);

    let body = response.text().await.unwrap_or_default();
    let title = TITLE_RE
        .captures(&body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    WebAssetPatch {
        title,
        status_code: Some(status),
        content_length,
        content_type,
        server,
        is_alive: Some(true),
        ..WebAssetPatch::default()
    }
}
