//! Technology fingerprinting of live web assets.
//!
//! Combines the rule-based fingerprint engine (run over a fresh fetch of
//! the asset) with cheap header/title heuristics, and writes the merged
//! labels into the asset's `technologies`.

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::fingerprints;
use crate::store::assets::WebAssetPatch;
use crate::store::models::{ScanTask, WebAsset};
use crate::util::{json_bool, json_i64};

use super::tools::HTTP_PROBE_TIMEOUT;
use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 500);
    let verify_tls = ctx.settings.scan_verify_tls && !json_bool(&task.config, "insecure", false);

    let engine = fingerprints::global(&ctx.settings.fingerprint_db);
    let assets = ctx
        .store
        .list_web_assets(task.project_id, Some(true), batch_size)
        .await?;

    let mut identified = 0u64;
    for asset in &assets {
        let mut labels = heuristic_labels(asset);

        if let Some((body, headers)) = fetch_response(&asset.url, verify_tls).await {
            for matched in engine.match_response(&body, &headers, None) {
                if !labels.contains(&matched.name) {
                    labels.push(matched.name);
                }
            }
        }

        if labels.is_empty() {
            continue;
        }
        ctx.store
            .upsert_web_asset(
                task.project_id,
                &asset.url,
                WebAssetPatch {
                    technologies: Some(labels),
                    ..WebAssetPatch::default()
                },
            )
            .await?;
        identified += 1;
    }

    info!(scanned = assets.len(), identified, "fingerprint scan finished");
    Ok(json!({ "assets_scanned": assets.len(), "identified": identified }))
}

/// Server-header and title heuristics for the common stacks.
fn heuristic_labels(asset: &WebAsset) -> Vec<String> {
    let mut labels = Vec::new();

    if let Some(server) = &asset.server {
        let server = server.to_ascii_lowercase();
        for (needle, label) in [
            ("nginx", "Nginx"),
            ("apache", "Apache"),
            ("iis", "IIS"),
            ("tomcat", "Tomcat"),
        ] {
            if server.contains(needle) {
                labels.push(label.to_string());
                break;
            }
        }
    }

    if let Some(title) = &asset.title {
        let title = title.to_ascii_lowercase();
        for (needle, label) in [
            ("wordpress", "WordPress"),
            ("drupal", "Drupal"),
            ("joomla", "Joomla"),
            ("phpmyadmin", "phpMyAdmin"),
            ("weblogic", "WebLogic"),
            ("jenkins", "Jenkins"),
            ("gitlab", "GitLab"),
            ("grafana", "Grafana"),
            ("kibana", "Kibana"),
            ("zabbix", "Zabbix"),
            ("nagios", "Nagios"),
            ("confluence", "Confluence"),
            ("jira", "Jira"),
        ] {
            if title.contains(needle) {
                labels.push(label.to_string());
            }
        }
    }

    labels
}

async fn fetch_response(
    url: &str,
    verify_tls: bool,
) -> Option<(String, FxHashMap<String, String>)> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .danger_accept_invalid_certs(!verify_tls)
        .user_agent("EASM-Scanner/1.0")
        .build()
        .ok()?;
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url, error = %e, "fingerprint fetch failed");
            return None;
        }
    };

    let mut headers = FxHashMap::default();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let body = response.text().await.ok()?;
    Some((body, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn asset(server: Option<&str>, title: Option<&str>) -> WebAsset {
        WebAsset {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            url: "http://example.com".to_string(),
            normalized_url: "http://example.com/".to_string(),
            ip_id: None,
            port_id: None,
            title: title.map(String::from),
            status_code: Some(200),
            content_length: None,
            content_type: None,
            server: server.map(String::from),
            technologies: Vec::new(),
            is_alive: true,
            screenshot_path: None,
            fingerprint_hash: None,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn server_header_heuristics() {
        assert_eq!(
            heuristic_labels(&asset(Some("nginx/1.25.3"), None)),
            vec!["Nginx".to_string()]
        );
        assert_eq!(
            heuristic_labels(&asset(Some("Apache/2.4"), None)),
            vec!["Apache".to_string()]
        );
    }

    #[test]
    fn title_heuristics_stack() {
        let labels = heuristic_labels(&asset(
            Some("nginx"),
            Some("Welcome to WordPress and Grafana dashboards"),
        ));
        assert_eq!(
            labels,
            vec![
                "Nginx".to_string(),
                "WordPress".to_string(),
                "Grafana".to_string()
            ]
        );
    }

    #[test]
    fn no_signal_no_labels() {
        assert!(heuristic_labels(&asset(None, Some("Plain page"))).is_empty());
    }
}
