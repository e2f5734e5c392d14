//! DNS resolution for discovered subdomains.
//!
//! Resolves each subdomain, writes the addresses back onto the row, and
//! upserts one IPAddress per resolved address.

use serde_json::{Value, json};
use tokio::net::lookup_host;
use tracing::info;

use crate::store::models::ScanTask;
use crate::util::{json_i64, json_str};

use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let root_domain = json_str(&task.config, "root_domain").map(|s| s.to_string());
    let batch_size = json_i64(&task.config, "batch_size", 1000);

    let subdomains = ctx
        .store
        .list_subdomains(task.project_id, root_domain.as_deref(), batch_size)
        .await?;

    let mut resolved = 0u64;
    for sub in &subdomains {
        let addrs = match lookup_host((sub.subdomain.as_str(), 80u16)).await {
            Ok(addrs) => addrs.map(|a| a.ip().to_string()).collect::<Vec<_>>(),
            Err(_) => continue,
        };
        if addrs.is_empty() {
            continue;
        }
        let mut unique = Vec::new();
        for addr in addrs {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        ctx.store
            .upsert_subdomain(
                task.project_id,
                &sub.root_domain,
                &sub.subdomain,
                &sub.source,
                Some(&unique),
                None,
            )
            .await?;
        for ip in &unique {
            ctx.store
                .upsert_ip_address(task.project_id, ip, "dns_resolve")
                .await?;
        }
        resolved += 1;
    }

    info!(processed = subdomains.len(), resolved, "dns resolve finished");
    Ok(json!({
        "subdomains_processed": subdomains.len(),
        "resolved": resolved,
    }))
}
