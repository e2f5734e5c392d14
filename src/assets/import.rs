//! Bulk asset import with scan-table fan-out and event emission.
//!
//! Imported values land in the generic asset ledger, then fan out into
//! the typed graph: domains become subdomains (rooted at their last two
//! labels), IPs become IPAddress rows, URLs become web assets. When
//! anything new was inserted, exactly one `asset_created` event is
//! emitted for the batch.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::event_types;
use crate::queue::{Job, TaskQueue};
use crate::store::Store;
use crate::store::assets::WebAssetPatch;

/// One asset in an import request.
#[derive(Clone, Debug)]
pub struct ImportAsset {
    /// `domain`, `ip`, or `url`.
    pub asset_type: String,
    pub value: String,
    pub source: Option<String>,
}

/// Counters returned to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub inserted: u64,
    pub skipped: u64,
    pub total: u64,
}

/// Root domain heuristic: the last two labels.
fn guess_root_domain(domain: &str) -> String {
    let parts: Vec<&str> = domain
        .trim()
        .trim_end_matches('.')
        .split('.')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2..].join(".").to_lowercase()
    } else {
        domain.trim().to_lowercase()
    }
}

fn normalize_import_url(value: &str) -> Option<String> {
    let url = value.trim();
    if url.is_empty() {
        return None;
    }
    if url.contains("://") {
        Some(url.to_string())
    } else {
        Some(format!("http://{url}"))
    }
}

/// Import a batch of assets into `project_id`.
pub async fn import_assets(
    store: &Store,
    queue: &Arc<TaskQueue>,
    project_id: Uuid,
    assets: &[ImportAsset],
) -> Result<ImportOutcome, crate::store::StoreError> {
    let normalized: Vec<(String, String, Option<String>)> = assets
        .iter()
        .filter(|a| !a.value.trim().is_empty())
        .map(|a| {
            (
                a.asset_type.trim().to_lowercase(),
                a.value.trim().to_string(),
                a.source.clone(),
            )
        })
        .collect();

    let (inserted, skipped, total) = store.bulk_import_assets(project_id, &normalized).await?;

    sync_to_scan_tables(store, project_id, &normalized).await;

    if inserted > 0 {
        let mut asset_types: Vec<&str> = normalized.iter().map(|(t, _, _)| t.as_str()).collect();
        asset_types.sort_unstable();
        asset_types.dedup();

        // Order-preserving dedup: a value imported twice appears once in
        // the event payload.
        let values_of = |kind: &str| -> Vec<String> {
            let mut seen = rustc_hash::FxHashSet::default();
            normalized
                .iter()
                .filter(|(t, _, _)| t == kind)
                .filter(|(_, v, _)| seen.insert(v.as_str()))
                .map(|(_, v, _)| v.clone())
                .collect()
        };
        let domains = values_of("domain");
        let ips = values_of("ip");
        let urls: Vec<String> = values_of("url")
            .iter()
            .filter_map(|v| normalize_import_url(v))
            .collect();

        let event_data = json!({
            "source": "assets_import",
            "inserted": inserted,
            "skipped": skipped,
            "total": total,
            "asset_types": asset_types,
            "domain": domains.first(),
            "domains": domains.iter().take(50).collect::<Vec<_>>(),
            "ips": ips.iter().take(100).collect::<Vec<_>>(),
            "urls": urls.iter().take(50).collect::<Vec<_>>(),
        });

        let job = Job::ProcessEvent {
            project_id,
            event_type: event_types::ASSET_CREATED.to_string(),
            event_data,
        };
        if let Err(e) = queue.dispatch(job, 4) {
            warn!(project = %project_id, error = %e, "asset_created enqueue failed");
        }
    }

    info!(project = %project_id, inserted, skipped, total, "asset import finished");
    Ok(ImportOutcome {
        inserted,
        skipped,
        total,
    })
}

/// Fan imported values out into the typed asset graph. Best-effort: a
/// single bad value must not fail the import.
async fn sync_to_scan_tables(
    store: &Store,
    project_id: Uuid,
    assets: &[(String, String, Option<String>)],
) {
    let mut seen = rustc_hash::FxHashSet::default();
    for (asset_type, value, source) in assets {
        if !seen.insert((asset_type.as_str(), value.as_str())) {
            continue;
        }
        let source = source.clone().unwrap_or_else(|| "asset_import".to_string());
        let result = match asset_type.as_str() {
            "domain" => {
                let domain = value.to_lowercase();
                let root = guess_root_domain(&domain);
                store
                    .upsert_subdomain(project_id, &root, &domain, &source, None, None)
                    .await
                    .map(|_| ())
            }
            "ip" => store
                .upsert_ip_address(project_id, value, &source)
                .await
                .map(|_| ()),
            "url" => match normalize_import_url(value) {
                Some(url) => store
                    .upsert_web_asset(project_id, &url, WebAssetPatch::default())
                    .await
                    .map(|_| ()),
                None => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(project = %project_id, asset_type, value, error = %e,
                "failed to sync imported asset into the scan tables");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_domain_takes_last_two_labels() {
        assert_eq!(guess_root_domain("sub.example.com"), "example.com");
        assert_eq!(guess_root_domain("a.b.c.example.org"), "example.org");
        assert_eq!(guess_root_domain("localhost"), "localhost");
        assert_eq!(guess_root_domain("Example.COM."), "example.com");
    }

    #[test]
    fn import_url_defaults_scheme() {
        assert_eq!(
            normalize_import_url("example.com/x"),
            Some("http://example.com/x".to_string())
        );
        assert_eq!(
            normalize_import_url("https://example.com"),
            Some("https://example.com".to_string())
        );
        assert_eq!(normalize_import_url("  "), None);
    }
}
