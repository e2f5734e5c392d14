//! Screenshot capture via `gowitness`.
//!
//! Without the binary the task completes with zero captures; screenshots
//! are an enrichment, not a pipeline dependency.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

use crate::store::assets::WebAssetPatch;
use crate::store::models::ScanTask;
use crate::util::json_i64;

use super::tools::{GOWITNESS_TIMEOUT, binary_on_path, run_tool};
use super::{ScanContext, ScanError};

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let batch_size = json_i64(&task.config, "batch_size", 100);
    let screenshot_dir = ctx.settings.screenshot_dir.clone();

    tokio::fs::create_dir_all(&screenshot_dir)
        .await
        .map_err(|e| ScanError::Tool {
            tool: "screenshot".to_string(),
            message: format!("cannot create {screenshot_dir}: {e}"),
        })?;

    let assets = ctx
        .store
        .list_web_assets(task.project_id, Some(true), batch_size)
        .await?;

    let mut captured = 0u64;
    for asset in &assets {
        if asset.screenshot_path.is_some() {
            continue;
        }
        let Some(path) = capture(&asset.url, &task.project_id.to_string(), &screenshot_dir).await
        else {
            continue;
        };
        ctx.store
            .upsert_web_asset(
                task.project_id,
                &asset.url,
                WebAssetPatch {
                    screenshot_path: Some(path),
                    ..WebAssetPatch::default()
                },
            )
            .await?;
        captured += 1;
    }

    info!(processed = assets.len(), captured, "screenshot scan finished");
    Ok(json!({ "assets_processed": assets.len(), "captured": captured }))
}

async fn capture(url: &str, project_id: &str, dir: &str) -> Option<String> {
    if binary_on_path("gowitness").is_none() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let url_hash = &hex::encode(hasher.finalize())[..12];
    let filename = format!("{project_id}_{url_hash}.png");
    let filepath = Path::new(dir).join(&filename);
    let filepath_str = filepath.to_string_lossy().to_string();

    match run_tool(
        "gowitness",
        &["single", url, "-o", &filepath_str, "--timeout", "15"],
        GOWITNESS_TIMEOUT,
    )
    .await
    {
        Ok(_) if filepath.exists() => Some(format!("/screenshots/{filename}")),
        Ok(_) => None,
        Err(e) => {
            warn!(url, error = %e, "gowitness capture failed");
            None
        }
    }
}
