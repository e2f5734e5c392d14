//! Xray web vulnerability scanning.
//!
//! Plugins come from a static allowlist; results land in the same
//! vulnerability table as nuclei findings, keyed by plugin name.

use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::Job;
use crate::store::assets::VulnerabilityInput;
use crate::store::models::ScanTask;
use crate::types::Severity;
use crate::util::{json_bool, json_i64};

use super::tools::{XRAY_TIMEOUT, binary_on_path, run_tool, validate_plugins};
use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 50);
    let use_crawler = json_bool(&task.config, "use_crawler", false);
    let plugins = validate_plugins(&string_list(&task.config, "plugins"));

    let assets = ctx
        .store
        .list_web_assets(task.project_id, Some(true), batch_size)
        .await?;
    let urls: Vec<String> = assets.iter().map(|a| a.url.clone()).collect();
    if urls.is_empty() {
        return Ok(json!({ "urls_scanned": 0, "vulnerabilities_found": 0 }));
    }

    let mut vuln_count = 0u64;
    for url in &urls {
        let results = execute_xray(url, &plugins, use_crawler).await;
        for result in results {
            if let Some(vuln) = parse_result(&result, task.id) {
                let severity = vuln.severity;
                let title = vuln.title.clone().unwrap_or_else(|| vuln.template_id.clone());
                let stored = ctx.store.upsert_vulnerability(task.project_id, vuln).await?;
                vuln_count += 1;

                let job = Job::VulnerabilityAlert {
                    project_id: task.project_id,
                    vulnerability_id: stored.id,
                    severity,
                    title,
                    details: json!({
                        "target_url": stored.target_url,
                        "template_id": stored.template_id,
                    }),
                };
                if let Err(e) = ctx.queue.dispatch(job, 4) {
                    warn!(error = %e, "alert check enqueue failed");
                }
            }
        }
    }

    info!(urls = urls.len(), vulns = vuln_count, "xray scan finished");
    Ok(json!({ "urls_scanned": urls.len(), "vulnerabilities_found": vuln_count }))
}

fn string_list(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

async fn execute_xray(url: &str, plugins: &[String], use_crawler: bool) -> Vec<Value> {
    if binary_on_path("xray").is_none() {
        warn!("xray not found on PATH, skipping scan");
        return Vec::new();
    }

    let output_path = std::env::temp_dir().join(format!("xray-output-{}.json", Uuid::new_v4()));
    let output_str = output_path.to_string_lossy().to_string();
    let joined_plugins = plugins.join(",");

    let mut args = vec!["webscan"];
    if use_crawler {
        args.extend(["--basic-crawler", url]);
    } else {
        args.extend(["--url", url]);
    }
    if !plugins.is_empty() {
        args.extend(["--plugins", &joined_plugins]);
    }
    args.extend(["--json-output", &output_str]);

    let outcome = run_tool("xray", &args, XRAY_TIMEOUT).await;
    let results = match outcome {
        Ok(_) => match tokio::fs::read_to_string(&output_path).await {
            Ok(content) => serde_json::from_str::<Vec<Value>>(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        },
        Err(e) => {
            warn!(url, error = %e, "xray execution failed");
            Vec::new()
        }
    };
    let _ = tokio::fs::remove_file(&output_path).await;
    results
}

fn parse_result(result: &Value, scan_task_id: Uuid) -> Option<VulnerabilityInput> {
    let plugin = result.get("plugin").and_then(Value::as_str)?.to_string();
    let detail = result.get("detail").cloned().unwrap_or_else(|| json!({}));
    let target_url = detail
        .get("addr")
        .or_else(|| result.get("target").and_then(|t| t.get("url")))
        .and_then(Value::as_str)?
        .to_string();

    Some(VulnerabilityInput {
        target_url,
        template_id: format!("xray:{plugin}"),
        template_name: Some(plugin.clone()),
        severity: severity_for_plugin(&plugin),
        vuln_type: Some("web".to_string()),
        title: Some(format!("xray {plugin} finding")),
        description: detail
            .get("description")
            .and_then(Value::as_str)
            .map(String::from),
        scan_task_id: Some(scan_task_id),
        raw_output: Some(result.clone()),
        ..VulnerabilityInput::default()
    })
}

/// Coarse severity mapping by plugin family.
fn severity_for_plugin(plugin: &str) -> Severity {
    match plugin {
        "sqldet" | "cmd-injection" | "xxe" | "struts" | "xstream" => Severity::Critical,
        "xss" | "ssrf" | "path-traversal" | "upload" => Severity::High,
        "redirect" | "crlf-injection" | "jsonp" => Severity::Medium,
        "dirscan" | "baseline" | "brute-force" => Severity::Low,
        _ => Severity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xray_result() {
        let result = json!({
            "plugin": "sqldet",
            "detail": {"addr": "https://example.com/item?id=1"}
        });
        let parsed = parse_result(&result, Uuid::new_v4()).expect("parsed");
        assert_eq!(parsed.template_id, "xray:sqldet");
        assert_eq!(parsed.severity, Severity::Critical);
        assert_eq!(parsed.target_url, "https://example.com/item?id=1");
    }

    #[test]
    fn result_without_plugin_is_dropped() {
        assert!(parse_result(&json!({"detail": {}}), Uuid::new_v4()).is_none());
    }
}
