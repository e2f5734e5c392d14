//! Subdomain enumeration.
//!
//! Prefers the `subfinder` binary; without it, a small seed list keeps
//! the pipeline alive so downstream DAG nodes still have input.

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::assets::ScanFilter;
use crate::store::models::ScanTask;
use crate::util::json_str;

use super::tools::{SUBFINDER_TIMEOUT, binary_on_path, run_tool, validate_domain};
use super::{ScanContext, ScanError};

const SEED_PREFIXES: [&str; 6] = ["www", "api", "mail", "dev", "test", "staging"];

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let domain = json_str(&task.config, "domain")
        .ok_or_else(|| ScanError::InvalidConfig("domain is required in config".to_string()))?
        .to_string();
    validate_domain(&domain)?;

    let names = enumerate(&domain).await;

    let filter = scan_filter_from_config(&task.config);
    let names: Vec<String> = filter.filter_targets(names.iter().map(String::as_str));

    let count = ctx
        .store
        .bulk_upsert_subdomains(task.project_id, &domain, &names, "subfinder")
        .await?;
    info!(domain, found = count, "subdomain scan finished");

    Ok(json!({ "domain": domain, "subdomains_found": count }))
}

async fn enumerate(domain: &str) -> Vec<String> {
    if binary_on_path("subfinder").is_some() {
        match run_tool("subfinder", &["-d", domain, "-silent"], SUBFINDER_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
                if !names.is_empty() {
                    return names;
                }
            }
            Ok(output) => {
                warn!(code = ?output.status.code(), "subfinder exited non-zero, using seed list");
            }
            Err(e) => {
                warn!(error = %e, "subfinder failed, using seed list");
            }
        }
    }
    SEED_PREFIXES
        .iter()
        .map(|p| format!("{p}.{domain}"))
        .collect()
}

fn scan_filter_from_config(config: &Value) -> ScanFilter {
    let list = |key: &str| -> Vec<String> {
        config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    };
    ScanFilter::new(list("whitelist"), list("blacklist"))
}
