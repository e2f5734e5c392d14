//! JS deep analysis: script discovery, API endpoint extraction, and
//! static API risk classification.

use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::store::models::ScanTask;
use crate::util::{json_bool, json_i64};

use super::js_parser::{classify_endpoint_risks, extract_endpoints_from_js, extract_host, extract_scripts_from_html};
use super::tools::FETCH_TIMEOUT;
use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 100);
    let max_scripts_per_page = json_i64(&task.config, "max_scripts_per_page", 20) as usize;
    let max_script_size = json_i64(&task.config, "max_script_size", 512_000) as usize;
    let verify_tls = ctx.settings.scan_verify_tls && !json_bool(&task.config, "insecure", false);

    let assets = ctx
        .store
        .list_web_assets(task.project_id, Some(true), batch_size)
        .await?;

    let mut script_keys: FxHashSet<(String, String)> = FxHashSet::default();
    let mut endpoint_keys: FxHashSet<(String, String)> = FxHashSet::default();
    let mut risk_keys: FxHashSet<(String, String)> = FxHashSet::default();

    for asset in &assets {
        let Some(html) = fetch_text(&asset.url, verify_tls, max_script_size).await else {
            continue;
        };

        let scripts = extract_scripts_from_html(&html, &asset.url);
        for script in scripts.into_iter().take(max_scripts_per_page) {
            let content = match script.content {
                Some(inline) => Some(inline),
                None => fetch_text(&script.script_url, verify_tls, max_script_size).await,
            };
            let Some(content) = content else { continue };

            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            let content_hash = hex::encode(hasher.finalize());

            let js_asset = ctx
                .store
                .upsert_js_asset(
                    task.project_id,
                    Some(asset.id),
                    &script.script_url,
                    script.script_type,
                    &content_hash,
                    Some(&asset.url),
                    &json!({ "content_length": content.len() }),
                )
                .await?;
            script_keys.insert((script.script_url.clone(), content_hash));

            for endpoint in extract_endpoints_from_js(&content) {
                let record = ctx
                    .store
                    .upsert_api_endpoint(
                        task.project_id,
                        Some(js_asset.id),
                        &endpoint.endpoint,
                        &endpoint.method,
                        extract_host(&endpoint.endpoint).as_deref(),
                        &json!({
                            "script_url": script.script_url,
                            "source_url": asset.url,
                            "snippet": endpoint.evidence,
                        }),
                    )
                    .await?;
                endpoint_keys.insert((endpoint.method.clone(), endpoint.endpoint.clone()));

                for risk in classify_endpoint_risks(&endpoint.endpoint, &endpoint.method) {
                    ctx.store
                        .upsert_api_risk_finding(
                            task.project_id,
                            Some(record.id),
                            risk.rule_name,
                            risk.severity,
                            Some(risk.title),
                            Some(risk.description),
                            &json!({
                                "endpoint": endpoint.endpoint,
                                "method": endpoint.method,
                                "script_url": script.script_url,
                                "risk_tags": risk.risk_tags,
                            }),
                        )
                        .await?;
                    risk_keys.insert((record.id.to_string(), risk.rule_name.to_string()));
                }
            }
        }
    }

    info!(
        pages = assets.len(),
        scripts = script_keys.len(),
        endpoints = endpoint_keys.len(),
        risks = risk_keys.len(),
        "js api discovery finished"
    );
    Ok(json!({
        "pages_scanned": assets.len(),
        "scripts_discovered": script_keys.len(),
        "api_endpoints_discovered": endpoint_keys.len(),
        "api_risks_flagged": risk_keys.len(),
    }))
}

/// Fetch a text body with a size cap; failures yield `None`.
async fn fetch_text(url: &str, verify_tls: bool, max_size: usize) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .danger_accept_invalid_certs(!verify_tls)
        .user_agent("EASM-JS-Analyzer/1.0")
        .build()
        .ok()?;
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url, error = %e, "fetch failed");
            return None;
        }
    };
    let body = response.text().await.ok()?;
    if body.len() > max_size {
        let mut cut = max_size;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        return Some(body[..cut].to_string());
    }
    Some(body)
}
