//! Project CRUD, the generic asset ledger, and the project cascade
//! delete.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::models::{AssetEntity, Project};
use super::{Result, Store, StoreError, json_text, parse_json, parse_uuid};

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "project.id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        rate_limit_config: parse_json(
            row.try_get("rate_limit_config")?,
            serde_json::json!({}),
        ),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn asset_entity_from_row(row: &SqliteRow) -> Result<AssetEntity> {
    Ok(AssetEntity {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "asset_entity.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "asset_entity.project_id",
        )?,
        asset_type: row.try_get("asset_type")?,
        value: row.try_get("value")?,
        source: row.try_get("source")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

impl Store {
    pub async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        rate_limit_config: &serde_json::Value,
    ) -> Result<Project> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO projects (id, name, description, rate_limit_config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(description)
        .bind(json_text(rate_limit_config))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get_project(id).await?.ok_or(StoreError::NotFound {
                what: "project".to_string(),
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict {
                    reason: format!("project name {name:?} already exists"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(project_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn list_projects(&self, offset: i64, limit: i64) -> Result<(i64, Vec<Project>)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .iter()
            .map(project_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((total, items))
    }

    pub async fn update_project(
        &self,
        project_id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        rate_limit_config: Option<&serde_json::Value>,
    ) -> Result<Project> {
        let updated = sqlx::query(
            "UPDATE projects SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                rate_limit_config = COALESCE(?, rate_limit_config),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(rate_limit_config.map(json_text))
        .bind(Utc::now())
        .bind(project_id.to_string())
        .execute(&self.pool)
        .await;

        match updated {
            Ok(result) if result.rows_affected() == 0 => Err(StoreError::NotFound {
                what: "project".to_string(),
            }),
            Ok(_) => self.get_project(project_id).await?.ok_or(StoreError::NotFound {
                what: "project".to_string(),
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict {
                    reason: "project name already exists".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cascade delete, leaves first: findings and endpoints, the asset
    /// graph, scan bookkeeping, alerting, risk, then orchestration and
    /// finally the project row. Runs in one transaction.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<bool> {
        if self.get_project(project_id).await?.is_none() {
            return Ok(false);
        }
        let pid = project_id.to_string();
        let mut tx = self.pool.begin().await?;

        for sql in [
            "DELETE FROM api_risk_findings WHERE project_id = ?",
            "DELETE FROM api_endpoints WHERE project_id = ?",
            "DELETE FROM js_assets WHERE project_id = ?",
            "DELETE FROM web_assets WHERE project_id = ?",
            "DELETE FROM ports WHERE ip_id IN (SELECT id FROM ip_addresses WHERE project_id = ?)",
            "DELETE FROM ip_addresses WHERE project_id = ?",
            "DELETE FROM subdomains WHERE project_id = ?",
            "DELETE FROM vulnerabilities WHERE project_id = ?",
            "DELETE FROM scan_tasks WHERE project_id = ?",
            "DELETE FROM scan_policies WHERE project_id = ?",
            "DELETE FROM asset_entities WHERE project_id = ?",
            "DELETE FROM alert_records WHERE project_id = ?",
            "DELETE FROM alert_policies WHERE project_id = ?",
            "DELETE FROM notification_channels WHERE project_id = ?",
            "DELETE FROM asset_risk_scores WHERE project_id = ?",
            "DELETE FROM risk_factors WHERE project_id = ?",
            "DELETE FROM dag_executions WHERE project_id = ?",
            "DELETE FROM event_triggers WHERE project_id = ?",
            "DELETE FROM dag_templates WHERE project_id = ?",
            "DELETE FROM projects WHERE id = ?",
        ] {
            sqlx::query(sql).bind(&pid).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Insert-or-ignore a batch of imported assets, deduplicated by
    /// `(asset_type, value)` first. Returns `(inserted, skipped, total)`
    /// where `total` counts the raw input.
    pub async fn bulk_import_assets(
        &self,
        project_id: Uuid,
        assets: &[(String, String, Option<String>)],
    ) -> Result<(u64, u64, u64)> {
        let total = assets.len() as u64;
        if assets.is_empty() {
            return Ok((0, 0, 0));
        }

        let mut deduped: Vec<&(String, String, Option<String>)> = Vec::new();
        let mut seen = rustc_hash::FxHashSet::default();
        for asset in assets {
            if seen.insert((asset.0.as_str(), asset.1.as_str())) {
                deduped.push(asset);
            }
        }

        let now = Utc::now();
        let mut inserted = 0u64;
        for (asset_type, value, source) in deduped {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO asset_entities
                    (id, project_id, asset_type, value, source, first_seen, last_seen)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id.to_string())
            .bind(asset_type)
            .bind(value)
            .bind(source.as_deref())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }

        Ok((inserted, total - inserted, total))
    }

    pub async fn list_assets(
        &self,
        project_id: Uuid,
        asset_type: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<AssetEntity>)> {
        let pid = project_id.to_string();
        let (total, rows) = match asset_type {
            Some(kind) => {
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM asset_entities WHERE project_id = ? AND asset_type = ?",
                )
                .bind(&pid)
                .bind(kind)
                .fetch_one(&self.pool)
                .await?;
                let rows = sqlx::query(
                    "SELECT * FROM asset_entities WHERE project_id = ? AND asset_type = ?
                     ORDER BY first_seen DESC LIMIT ? OFFSET ?",
                )
                .bind(&pid)
                .bind(kind)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM asset_entities WHERE project_id = ?")
                        .bind(&pid)
                        .fetch_one(&self.pool)
                        .await?;
                let rows = sqlx::query(
                    "SELECT * FROM asset_entities WHERE project_id = ?
                     ORDER BY first_seen DESC LIMIT ? OFFSET ?",
                )
                .bind(&pid)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };
        let items = rows
            .iter()
            .map(asset_entity_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((total, items))
    }
}
