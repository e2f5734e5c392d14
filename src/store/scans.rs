//! Scan task bookkeeping and scan policies.
//!
//! The task state machine is enforced here: every transition is a
//! conditional `UPDATE ... WHERE id = ? AND status IN (...)`, so exactly
//! one caller wins a race and a terminal status absorbs late updates.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::types::{ScanStatus, TaskType};

use super::models::{ScanPolicy, ScanTask};
use super::{Result, Store, StoreError, json_text, opt_uuid, parse_json, parse_uuid};

fn scan_task_from_row(row: &SqliteRow) -> Result<ScanTask> {
    let task_type_raw: String = row.try_get("task_type")?;
    let status_raw: String = row.try_get("status")?;
    Ok(ScanTask {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "scan_task.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "scan_task.project_id")?,
        scan_policy_id: opt_uuid(row.try_get("scan_policy_id")?, "scan_task.scan_policy_id")?,
        task_type: TaskType::parse(&task_type_raw).ok_or_else(|| StoreError::Corrupt {
            reason: format!("scan_task.task_type: {task_type_raw:?}"),
        })?,
        status: ScanStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
            reason: format!("scan_task.status: {status_raw:?}"),
        })?,
        priority: row.try_get("priority")?,
        progress: row.try_get("progress")?,
        total_targets: row.try_get("total_targets")?,
        completed_targets: row.try_get("completed_targets")?,
        config: parse_json(row.try_get("config")?, serde_json::json!({})),
        result_summary: row
            .try_get::<Option<String>, _>("result_summary")?
            .and_then(|text| serde_json::from_str(&text).ok()),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn scan_policy_from_row(row: &SqliteRow) -> Result<ScanPolicy> {
    Ok(ScanPolicy {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "scan_policy.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "scan_policy.project_id",
        )?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        scan_config: parse_json(row.try_get("scan_config")?, serde_json::json!({})),
        dag_template_id: opt_uuid(row.try_get("dag_template_id")?, "scan_policy.dag_template_id")?,
        is_default: row.try_get("is_default")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    pub async fn create_scan_task(
        &self,
        project_id: Uuid,
        task_type: TaskType,
        config: &serde_json::Value,
        priority: i64,
        scan_policy_id: Option<Uuid>,
        total_targets: i64,
    ) -> Result<ScanTask> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scan_tasks
                (id, project_id, scan_policy_id, task_type, status, priority, progress,
                 total_targets, completed_targets, config, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(scan_policy_id.map(|v| v.to_string()))
        .bind(task_type.as_str())
        .bind(priority.clamp(1, 10))
        .bind(total_targets)
        .bind(json_text(config))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_scan_task(id).await?.ok_or(StoreError::NotFound {
            what: "scan task".to_string(),
        })
    }

    pub async fn get_scan_task(&self, task_id: Uuid) -> Result<Option<ScanTask>> {
        let row = sqlx::query("SELECT * FROM scan_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_task_from_row).transpose()
    }

    pub async fn list_scan_tasks(
        &self,
        project_id: Uuid,
        status: Option<ScanStatus>,
        limit: i64,
    ) -> Result<Vec<ScanTask>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM scan_tasks WHERE project_id = ? AND status = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM scan_tasks WHERE project_id = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(scan_task_from_row).collect()
    }

    /// Guarded state transition. Succeeds only when the task currently
    /// sits in one of `from`; returns `None` when the guard loses (the
    /// caller maps that to a conflict). The conditional update is the
    /// serialization point: exactly one of two racing `start` calls
    /// proceeds.
    pub async fn transition_scan_status(
        &self,
        task_id: Uuid,
        from: &[ScanStatus],
        to: ScanStatus,
        error_message: Option<&str>,
        result_summary: Option<&serde_json::Value>,
    ) -> Result<Option<ScanTask>> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE scan_tasks SET
                status = ?,
                error_message = COALESCE(?, error_message),
                result_summary = COALESCE(?, result_summary),
                started_at = CASE WHEN ? = 'running' AND started_at IS NULL THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? IN ('completed', 'failed', 'cancelled')
                    THEN COALESCE(completed_at, ?) ELSE completed_at END
             WHERE id = ? AND status IN ({placeholders})"
        );

        let now = Utc::now();
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error_message)
            .bind(result_summary.map(json_text))
            .bind(to.as_str())
            .bind(now)
            .bind(to.as_str())
            .bind(now)
            .bind(task_id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let affected = query.execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Ok(None);
        }
        self.get_scan_task(task_id).await
    }

    /// Cancel is idempotent: an already-cancelled task reports success.
    pub async fn cancel_scan_task(&self, task_id: Uuid) -> Result<Option<ScanTask>> {
        let transitioned = self
            .transition_scan_status(
                task_id,
                &[ScanStatus::Pending, ScanStatus::Running, ScanStatus::Paused],
                ScanStatus::Cancelled,
                None,
                None,
            )
            .await?;
        if transitioned.is_some() {
            return Ok(transitioned);
        }
        match self.get_scan_task(task_id).await? {
            Some(task) if task.status == ScanStatus::Cancelled => Ok(Some(task)),
            _ => Ok(None),
        }
    }

    /// Refresh progress counters: `progress = floor(100 * completed / total)`
    /// when `total_targets > 0`, else 0.
    pub async fn update_scan_progress(
        &self,
        task_id: Uuid,
        completed_targets: i64,
    ) -> Result<Option<ScanTask>> {
        sqlx::query(
            "UPDATE scan_tasks SET
                completed_targets = ?,
                progress = CASE WHEN total_targets > 0
                    THEN (100 * ?) / total_targets ELSE 0 END
             WHERE id = ?",
        )
        .bind(completed_targets)
        .bind(completed_targets)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        self.get_scan_task(task_id).await
    }

    /// Update config/priority while the task is still editable
    /// (pending or paused).
    pub async fn update_scan_task(
        &self,
        task_id: Uuid,
        config: Option<&serde_json::Value>,
        priority: Option<i64>,
    ) -> Result<Option<ScanTask>> {
        let affected = sqlx::query(
            "UPDATE scan_tasks SET
                config = COALESCE(?, config),
                priority = COALESCE(?, priority)
             WHERE id = ? AND status IN ('pending', 'paused')",
        )
        .bind(config.map(json_text))
        .bind(priority.map(|p| p.clamp(1, 10)))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Ok(None);
        }
        self.get_scan_task(task_id).await
    }

    // -----------------------------------------------------------------
    // Scan policies
    // -----------------------------------------------------------------

    pub async fn create_scan_policy(
        &self,
        project_id: Uuid,
        name: &str,
        description: Option<&str>,
        scan_config: &serde_json::Value,
        dag_template_id: Option<Uuid>,
        is_default: bool,
        enabled: bool,
    ) -> Result<ScanPolicy> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // At most one default per project, enforced by side effect in the
        // same transaction.
        if is_default {
            sqlx::query("UPDATE scan_policies SET is_default = 0 WHERE project_id = ? AND is_default = 1")
                .bind(project_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO scan_policies
                (id, project_id, name, description, scan_config, dag_template_id,
                 is_default, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(name)
        .bind(description)
        .bind(json_text(scan_config))
        .bind(dag_template_id.map(|v| v.to_string()))
        .bind(is_default)
        .bind(enabled)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_scan_policy(id).await?.ok_or(StoreError::NotFound {
            what: "scan policy".to_string(),
        })
    }

    pub async fn get_scan_policy(&self, policy_id: Uuid) -> Result<Option<ScanPolicy>> {
        let row = sqlx::query("SELECT * FROM scan_policies WHERE id = ?")
            .bind(policy_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_policy_from_row).transpose()
    }

    pub async fn get_default_scan_policy(&self, project_id: Uuid) -> Result<Option<ScanPolicy>> {
        let row = sqlx::query(
            "SELECT * FROM scan_policies WHERE project_id = ? AND is_default = 1 LIMIT 1",
        )
        .bind(project_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scan_policy_from_row).transpose()
    }

    pub async fn list_scan_policies(
        &self,
        project_id: Uuid,
        enabled: Option<bool>,
    ) -> Result<Vec<ScanPolicy>> {
        let rows = match enabled {
            Some(flag) => {
                sqlx::query(
                    "SELECT * FROM scan_policies WHERE project_id = ? AND enabled = ?
                     ORDER BY created_at DESC",
                )
                .bind(project_id.to_string())
                .bind(flag)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM scan_policies WHERE project_id = ? ORDER BY created_at DESC")
                    .bind(project_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(scan_policy_from_row).collect()
    }

    pub async fn update_scan_policy(
        &self,
        policy_id: Uuid,
        scan_config: Option<&serde_json::Value>,
        is_default: Option<bool>,
        enabled: Option<bool>,
    ) -> Result<ScanPolicy> {
        let existing = self.get_scan_policy(policy_id).await?.ok_or(StoreError::NotFound {
            what: "scan policy".to_string(),
        })?;

        let mut tx = self.pool.begin().await?;
        if is_default == Some(true) {
            sqlx::query(
                "UPDATE scan_policies SET is_default = 0
                 WHERE project_id = ? AND is_default = 1 AND id != ?",
            )
            .bind(existing.project_id.to_string())
            .bind(policy_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE scan_policies SET
                scan_config = COALESCE(?, scan_config),
                is_default = COALESCE(?, is_default),
                enabled = COALESCE(?, enabled),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(scan_config.map(json_text))
        .bind(is_default)
        .bind(enabled)
        .bind(Utc::now())
        .bind(policy_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_scan_policy(policy_id).await?.ok_or(StoreError::NotFound {
            what: "scan policy".to_string(),
        })
    }

    pub async fn delete_scan_policy(&self, policy_id: Uuid) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM scan_policies WHERE id = ?")
            .bind(policy_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
