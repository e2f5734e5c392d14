//! Nuclei vulnerability scanning.
//!
//! Validates severity bands and template paths before they touch the
//! command line, parses the JSON-lines output, and upserts each finding.
//! Every stored finding enqueues an alert check.

use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::Job;
use crate::store::assets::VulnerabilityInput;
use crate::store::models::ScanTask;
use crate::types::Severity;
use crate::util::{json_i64, json_str};

use super::tools::{NUCLEI_TIMEOUT, binary_on_path, run_tool, validate_severity, validate_templates};
use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 100);
    let severity = validate_severity(json_str(&task.config, "severity").unwrap_or("medium,high,critical"));
    let templates = validate_templates(&string_list(&task.config, "templates"));

    let assets = ctx
        .store
        .list_web_assets(task.project_id, Some(true), batch_size)
        .await?;
    let urls: Vec<String> = assets.iter().map(|a| a.url.clone()).collect();
    if urls.is_empty() {
        return Ok(json!({ "urls_scanned": 0, "vulnerabilities_found": 0 }));
    }

    let results = execute_nuclei(&urls, &severity, &templates).await?;
    let mut vuln_count = 0u64;
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

    info!(urls = urls.len(), vulns = vuln_count, "nuclei scan finished");
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

async fn execute_nuclei(
    urls: &[String],
    severity: &str,
    templates: &[String],
) -> Result<Vec<Value>, ScanError> {
    if binary_on_path("nuclei").is_none() {
        warn!("nuclei not found on PATH, skipping scan");
        return Ok(Vec::new());
    }

    let targets_path = std::env::temp_dir().join(format!("nuclei-targets-{}.txt", Uuid::new_v4()));
    tokio::fs::write(&targets_path, urls.join("\n"))
        .await
        .map_err(|e| ScanError::Tool {
            tool: "nuclei".to_string(),
            message: format!("cannot write targets file: {e}"),
        })?;
    let targets = targets_path.to_string_lossy().to_string();

    let joined_templates = templates.join(",");
    let mut args = vec!["-l", &targets, "-severity", severity, "-json", "-silent"];
    if !templates.is_empty() {
        args.extend(["-t", &joined_templates]);
    }

    let outcome = run_tool("nuclei", &args, NUCLEI_TIMEOUT).await;
    let _ = tokio::fs::remove_file(&targets_path).await;

    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            // Tool failures degrade to an empty result set; the task
            // still reports how many urls it covered.
            warn!(error = %e, "nuclei execution failed");
            return Ok(Vec::new());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

fn parse_result(result: &Value, scan_task_id: Uuid) -> Option<VulnerabilityInput> {
    let info = result.get("info").cloned().unwrap_or_else(|| json!({}));
    let target_url = result
        .get("matched-at")
        .or_else(|| result.get("host"))
        .and_then(Value::as_str)?
        .to_string();

    let severity = info
        .get("severity")
        .and_then(Value::as_str)
        .and_then(Severity::parse)
        .unwrap_or(Severity::Info);

    Some(VulnerabilityInput {
        target_url,
        template_id: result
            .get("template-id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        template_name: info.get("name").and_then(Value::as_str).map(String::from),
        severity,
        vuln_type: result.get("type").and_then(Value::as_str).map(String::from),
        title: info.get("name").and_then(Value::as_str).map(String::from),
        description: info
            .get("description")
            .and_then(Value::as_str)
            .map(String::from),
        reference: info
            .get("reference")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        tags: info
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        matched_at: result
            .get("matched-at")
            .and_then(Value::as_str)
            .map(String::from),
        matcher_name: result
            .get("matcher-name")
            .and_then(Value::as_str)
            .map(String::from),
        extracted_results: result
            .get("extracted-results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        curl_command: result
            .get("curl-command")
            .and_then(Value::as_str)
            .map(String::from),
        request: result.get("request").and_then(Value::as_str).map(String::from),
        response: result.get("response").and_then(Value::as_str).map(String::from),
        scan_task_id: Some(scan_task_id),
        target_type: None,
        target_id: None,
        raw_output: Some(result.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nuclei_json_line() {
        let line = json!({
            "template-id": "tech-detect",
            "matched-at": "https://example.com/login",
            "type": "http",
            "matcher-name": "nginx",
            "info": {
                "name": "Tech Detect",
                "severity": "high",
                "description": "detects things",
                "tags": ["tech"],
                "reference": ["https://example.com/ref"]
            }
        });
        let parsed = parse_result(&line, Uuid::new_v4()).expect("parsed");
        assert_eq!(parsed.template_id, "tech-detect");
        assert_eq!(parsed.target_url, "https://example.com/login");
        assert_eq!(parsed.severity, Severity::High);
        assert_eq!(parsed.tags, vec!["tech".to_string()]);
    }

    #[test]
    fn unknown_severity_maps_to_info() {
        let line = json!({
            "template-id": "x",
            "host": "https://example.com",
            "info": {"severity": "unknown"}
        });
        let parsed = parse_result(&line, Uuid::new_v4()).expect("parsed");
        assert_eq!(parsed.severity, Severity::Info);
    }

    #[test]
    fn missing_target_is_dropped() {
        let line = json!({"template-id": "x", "info": {}});
        assert!(parse_result(&line, Uuid::new_v4()).is_none());
    }
}
