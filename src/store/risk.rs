//! Risk factors and computed asset risk scores.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::types::Severity;

use super::models::{AssetRiskScore, RiskFactor};
use super::{Result, Store, json_text, opt_uuid, parse_json, parse_severity, parse_uuid};

fn factor_from_row(row: &SqliteRow) -> Result<RiskFactor> {
    Ok(RiskFactor {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "risk_factor.id")?,
        project_id: opt_uuid(row.try_get("project_id")?, "risk_factor.project_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        factor_type: row.try_get("factor_type")?,
        weight: row.try_get("weight")?,
        max_score: row.try_get("max_score")?,
        calculation_rule: parse_json(row.try_get("calculation_rule")?, serde_json::json!({})),
        is_system: row.try_get("is_system")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
    })
}

fn score_from_row(row: &SqliteRow) -> Result<AssetRiskScore> {
    Ok(AssetRiskScore {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "risk_score.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "risk_score.project_id")?,
        asset_type: row.try_get("asset_type")?,
        asset_id: parse_uuid(&row.try_get::<String, _>("asset_id")?, "risk_score.asset_id")?,
        total_score: row.try_get("total_score")?,
        severity_level: parse_severity(&row.try_get::<String, _>("severity_level")?),
        factor_scores: parse_json(row.try_get("factor_scores")?, serde_json::json!({})),
        risk_summary: parse_json(row.try_get("risk_summary")?, serde_json::json!({})),
        calculated_at: row.try_get("calculated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl Store {
    pub async fn create_risk_factor(
        &self,
        project_id: Option<Uuid>,
        name: &str,
        factor_type: &str,
        weight: f64,
        max_score: i64,
        calculation_rule: &serde_json::Value,
        is_system: bool,
        enabled: bool,
    ) -> Result<RiskFactor> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO risk_factors
                (id, project_id, name, factor_type, weight, max_score, calculation_rule,
                 is_system, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.map(|v| v.to_string()))
        .bind(name)
        .bind(factor_type)
        .bind(weight)
        .bind(max_score)
        .bind(json_text(calculation_rule))
        .bind(is_system)
        .bind(enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM risk_factors WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        factor_from_row(&row)
    }

    /// Enabled factors visible to a project: its own plus system-wide
    /// rows, heaviest first.
    pub async fn list_risk_factors(
        &self,
        project_id: Uuid,
        include_system: bool,
    ) -> Result<Vec<RiskFactor>> {
        let rows = if include_system {
            sqlx::query(
                "SELECT * FROM risk_factors
                 WHERE enabled = 1 AND (project_id = ? OR is_system = 1)
                 ORDER BY weight DESC",
            )
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT * FROM risk_factors WHERE enabled = 1 AND project_id = ?
                 ORDER BY weight DESC",
            )
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(factor_from_row).collect()
    }

    /// Create-or-update keyed by `(project_id, asset_type, asset_id)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_risk_score(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
        total_score: f64,
        severity_level: Severity,
        factor_scores: &serde_json::Value,
        risk_summary: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AssetRiskScore> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO asset_risk_scores
                (id, project_id, asset_type, asset_id, total_score, severity_level,
                 factor_scores, risk_summary, calculated_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, asset_type, asset_id) DO UPDATE SET
                total_score = ?,
                severity_level = ?,
                factor_scores = ?,
                risk_summary = ?,
                calculated_at = ?,
                expires_at = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(asset_type)
        .bind(asset_id.to_string())
        .bind(total_score)
        .bind(severity_level.as_str())
        .bind(json_text(factor_scores))
        .bind(json_text(risk_summary))
        .bind(now)
        .bind(expires_at)
        .bind(total_score)
        .bind(severity_level.as_str())
        .bind(json_text(factor_scores))
        .bind(json_text(risk_summary))
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM asset_risk_scores
             WHERE project_id = ? AND asset_type = ? AND asset_id = ?",
        )
        .bind(project_id.to_string())
        .bind(asset_type)
        .bind(asset_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        score_from_row(&row)
    }

    pub async fn get_risk_score(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
    ) -> Result<Option<AssetRiskScore>> {
        let row = sqlx::query(
            "SELECT * FROM asset_risk_scores
             WHERE project_id = ? AND asset_type = ? AND asset_id = ?",
        )
        .bind(project_id.to_string())
        .bind(asset_type)
        .bind(asset_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(score_from_row).transpose()
    }

    pub async fn list_risk_scores(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssetRiskScore>> {
        let rows = sqlx::query(
            "SELECT * FROM asset_risk_scores WHERE project_id = ?
             ORDER BY total_score DESC LIMIT ?",
        )
        .bind(project_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(score_from_row).collect()
    }

    /// Asset references for a project-wide risk sweep:
    /// `(asset_type, id)` for subdomains, IPs, and web assets.
    pub async fn list_asset_refs(
        &self,
        project_id: Uuid,
        asset_type: Option<&str>,
    ) -> Result<Vec<(String, Uuid)>> {
        let pid = project_id.to_string();
        let mut refs = Vec::new();

        let want = |kind: &str| asset_type.is_none() || asset_type == Some(kind);

        if want("subdomain") {
            let rows = sqlx::query("SELECT id FROM subdomains WHERE project_id = ?")
                .bind(&pid)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                refs.push((
                    "subdomain".to_string(),
                    parse_uuid(&row.try_get::<String, _>("id")?, "subdomain.id")?,
                ));
            }
        }
        if want("ip_address") {
            let rows = sqlx::query("SELECT id FROM ip_addresses WHERE project_id = ?")
                .bind(&pid)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                refs.push((
                    "ip_address".to_string(),
                    parse_uuid(&row.try_get::<String, _>("id")?, "ip.id")?,
                ));
            }
        }
        if want("web_asset") {
            let rows = sqlx::query("SELECT id FROM web_assets WHERE project_id = ?")
                .bind(&pid)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                refs.push((
                    "web_asset".to_string(),
                    parse_uuid(&row.try_get::<String, _>("id")?, "web_asset.id")?,
                ));
            }
        }
        Ok(refs)
    }
}
