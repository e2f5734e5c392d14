//! Notification channels, alert policies, and alert records.
//!
//! Cooldown and aggregation queries fetch the candidate rows by
//! aggregation key and compare timestamps in Rust; the sets involved are
//! small and bounded by the policies' own caps.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::types::Severity;

use super::models::{AlertPolicy, AlertRecord, NotificationChannel};
use super::{
    Result, Store, StoreError, json_text, opt_uuid, parse_json, parse_severity, parse_uuid,
};

fn channel_from_row(row: &SqliteRow) -> Result<NotificationChannel> {
    Ok(NotificationChannel {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "channel.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "channel.project_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        channel_type: row.try_get("channel_type")?,
        config: parse_json(row.try_get("config")?, serde_json::json!({})),
        enabled: row.try_get("enabled")?,
        last_test_at: row.try_get("last_test_at")?,
        last_test_success: row.try_get("last_test_success")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn policy_from_row(row: &SqliteRow) -> Result<AlertPolicy> {
    let channel_ids_raw: Option<String> = row.try_get("channel_ids")?;
    let channel_ids = channel_ids_raw
        .as_deref()
        .and_then(|text| serde_json::from_str::<Vec<String>>(text).ok())
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| Uuid::parse_str(raw).ok())
        .collect();
    Ok(AlertPolicy {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "alert_policy.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "alert_policy.project_id",
        )?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        conditions: parse_json(row.try_get("conditions")?, serde_json::json!({})),
        severity_threshold: parse_severity(&row.try_get::<String, _>("severity_threshold")?),
        channel_ids,
        notification_template: row.try_get("notification_template")?,
        cooldown_minutes: row.try_get("cooldown_minutes")?,
        aggregation_window: row.try_get("aggregation_window")?,
        max_alerts_per_hour: row.try_get("max_alerts_per_hour")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<AlertRecord> {
    Ok(AlertRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "alert_record.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "alert_record.project_id",
        )?,
        policy_id: opt_uuid(row.try_get("policy_id")?, "alert_record.policy_id")?,
        target_type: row.try_get("target_type")?,
        target_id: opt_uuid(row.try_get("target_id")?, "alert_record.target_id")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        severity: parse_severity(&row.try_get::<String, _>("severity")?),
        details: parse_json(row.try_get("details")?, serde_json::json!({})),
        status: row.try_get("status")?,
        aggregation_key: row.try_get("aggregation_key")?,
        aggregated_count: row.try_get("aggregated_count")?,
        notification_results: parse_json(
            row.try_get("notification_results")?,
            serde_json::json!({}),
        ),
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

/// Policy knobs accepted at creation time.
#[derive(Clone, Debug)]
pub struct AlertPolicyInput {
    pub name: String,
    pub description: Option<String>,
    pub conditions: serde_json::Value,
    pub severity_threshold: Severity,
    pub channel_ids: Vec<Uuid>,
    pub notification_template: Option<String>,
    pub cooldown_minutes: i64,
    pub aggregation_window: i64,
    pub max_alerts_per_hour: i64,
    pub enabled: bool,
}

impl Default for AlertPolicyInput {
    fn default() -> Self {
        AlertPolicyInput {
            name: String::new(),
            description: None,
            conditions: serde_json::json!({}),
            severity_threshold: Severity::High,
            channel_ids: Vec::new(),
            notification_template: None,
            cooldown_minutes: 60,
            aggregation_window: 5,
            max_alerts_per_hour: 10,
            enabled: true,
        }
    }
}

impl Store {
    // -----------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------

    pub async fn create_notification_channel(
        &self,
        project_id: Uuid,
        name: &str,
        channel_type: &str,
        config: &serde_json::Value,
        description: Option<&str>,
        enabled: bool,
    ) -> Result<NotificationChannel> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO notification_channels
                (id, project_id, name, description, channel_type, config, enabled,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(name)
        .bind(description)
        .bind(channel_type)
        .bind(json_text(config))
        .bind(enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_notification_channel(id).await?.ok_or(StoreError::NotFound {
            what: "notification channel".to_string(),
        })
    }

    pub async fn get_notification_channel(
        &self,
        channel_id: Uuid,
    ) -> Result<Option<NotificationChannel>> {
        let row = sqlx::query("SELECT * FROM notification_channels WHERE id = ?")
            .bind(channel_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    pub async fn list_notification_channels(
        &self,
        project_id: Uuid,
        enabled: Option<bool>,
    ) -> Result<Vec<NotificationChannel>> {
        let rows = match enabled {
            Some(flag) => {
                sqlx::query(
                    "SELECT * FROM notification_channels
                     WHERE project_id = ? AND enabled = ? ORDER BY created_at DESC",
                )
                .bind(project_id.to_string())
                .bind(flag)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM notification_channels WHERE project_id = ?
                     ORDER BY created_at DESC",
                )
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(channel_from_row).collect()
    }

    pub async fn update_channel_test_result(
        &self,
        channel_id: Uuid,
        success: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE notification_channels SET last_test_at = ?, last_test_success = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(success)
        .bind(channel_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_notification_channel(&self, channel_id: Uuid) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM notification_channels WHERE id = ?")
            .bind(channel_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------

    pub async fn create_alert_policy(
        &self,
        project_id: Uuid,
        input: AlertPolicyInput,
    ) -> Result<AlertPolicy> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let channel_ids: Vec<String> = input.channel_ids.iter().map(|c| c.to_string()).collect();
        sqlx::query(
            "INSERT INTO alert_policies
                (id, project_id, name, description, conditions, severity_threshold,
                 channel_ids, notification_template, cooldown_minutes, aggregation_window,
                 max_alerts_per_hour, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(&input.name)
        .bind(input.description.as_deref())
        .bind(json_text(&input.conditions))
        .bind(input.severity_threshold.as_str())
        .bind(super::string_vec_json(&channel_ids))
        .bind(input.notification_template.as_deref())
        .bind(input.cooldown_minutes)
        .bind(input.aggregation_window)
        .bind(input.max_alerts_per_hour)
        .bind(input.enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_alert_policy(id).await?.ok_or(StoreError::NotFound {
            what: "alert policy".to_string(),
        })
    }

    pub async fn get_alert_policy(&self, policy_id: Uuid) -> Result<Option<AlertPolicy>> {
        let row = sqlx::query("SELECT * FROM alert_policies WHERE id = ?")
            .bind(policy_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    pub async fn list_alert_policies(
        &self,
        project_id: Uuid,
        enabled: Option<bool>,
    ) -> Result<Vec<AlertPolicy>> {
        let rows = match enabled {
            Some(flag) => {
                sqlx::query(
                    "SELECT * FROM alert_policies WHERE project_id = ? AND enabled = ?
                     ORDER BY created_at DESC",
                )
                .bind(project_id.to_string())
                .bind(flag)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM alert_policies WHERE project_id = ? ORDER BY created_at DESC",
                )
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(policy_from_row).collect()
    }

    pub async fn delete_alert_policy(&self, policy_id: Uuid) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM alert_policies WHERE id = ?")
            .bind(policy_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_alert_record(
        &self,
        project_id: Uuid,
        policy_id: Option<Uuid>,
        target_type: &str,
        target_id: Option<Uuid>,
        title: &str,
        message: &str,
        severity: Severity,
        details: &serde_json::Value,
        aggregation_key: Option<&str>,
    ) -> Result<AlertRecord> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO alert_records
                (id, project_id, policy_id, target_type, target_id, title, message,
                 severity, details, status, aggregation_key, aggregated_count,
                 notification_results, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 1, '{}', ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(policy_id.map(|v| v.to_string()))
        .bind(target_type)
        .bind(target_id.map(|v| v.to_string()))
        .bind(title)
        .bind(message)
        .bind(severity.as_str())
        .bind(json_text(details))
        .bind(aggregation_key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_alert_record(id).await?.ok_or(StoreError::NotFound {
            what: "alert record".to_string(),
        })
    }

    pub async fn get_alert_record(&self, record_id: Uuid) -> Result<Option<AlertRecord>> {
        let row = sqlx::query("SELECT * FROM alert_records WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_alert_records(
        &self,
        project_id: Uuid,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AlertRecord>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM alert_records WHERE project_id = ? AND status = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(s)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM alert_records WHERE project_id = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    /// A non-resolved record with the same aggregation key created inside
    /// the window, if any.
    pub async fn find_aggregatable_alert(
        &self,
        project_id: Uuid,
        aggregation_key: &str,
        window_minutes: i64,
    ) -> Result<Option<AlertRecord>> {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        let rows = sqlx::query(
            "SELECT * FROM alert_records
             WHERE project_id = ? AND aggregation_key = ? AND status IN ('pending', 'sent')",
        )
        .bind(project_id.to_string())
        .bind(aggregation_key)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let record = record_from_row(row)?;
            if record.created_at >= cutoff {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub async fn increment_aggregated_count(&self, record_id: Uuid) -> Result<AlertRecord> {
        sqlx::query("UPDATE alert_records SET aggregated_count = aggregated_count + 1 WHERE id = ?")
            .bind(record_id.to_string())
            .execute(&self.pool)
            .await?;
        self.get_alert_record(record_id).await?.ok_or(StoreError::NotFound {
            what: "alert record".to_string(),
        })
    }

    /// Any record with this aggregation key inside the cooldown window?
    pub async fn check_cooldown(
        &self,
        project_id: Uuid,
        aggregation_key: &str,
        cooldown_minutes: i64,
    ) -> Result<bool> {
        let cutoff = Utc::now() - Duration::minutes(cooldown_minutes);
        let rows = sqlx::query(
            "SELECT created_at FROM alert_records
             WHERE project_id = ? AND aggregation_key = ?",
        )
        .bind(project_id.to_string())
        .bind(aggregation_key)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            if created_at >= cutoff {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Alerts created for `policy_id` in the trailing hour window.
    pub async fn count_recent_alerts(
        &self,
        project_id: Uuid,
        policy_id: Uuid,
        hours: i64,
    ) -> Result<i64> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let rows = sqlx::query(
            "SELECT created_at FROM alert_records WHERE project_id = ? AND policy_id = ?",
        )
        .bind(project_id.to_string())
        .bind(policy_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut count = 0i64;
        for row in &rows {
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            if created_at >= cutoff {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Status workflow: `sent` stamps `sent_at` once, `acknowledged` and
    /// `resolved` stamp their timestamps.
    pub async fn update_alert_status(
        &self,
        record_id: Uuid,
        status: &str,
        acknowledged_by: Option<&str>,
    ) -> Result<AlertRecord> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE alert_records SET
                status = ?,
                sent_at = CASE WHEN ? = 'sent' THEN COALESCE(sent_at, ?) ELSE sent_at END,
                acknowledged_at = CASE WHEN ? = 'acknowledged' THEN ? ELSE acknowledged_at END,
                acknowledged_by = CASE WHEN ? = 'acknowledged' THEN ? ELSE acknowledged_by END,
                resolved_at = CASE WHEN ? = 'resolved' THEN ? ELSE resolved_at END
             WHERE id = ?",
        )
        .bind(status)
        .bind(status)
        .bind(now)
        .bind(status)
        .bind(now)
        .bind(status)
        .bind(acknowledged_by)
        .bind(status)
        .bind(now)
        .bind(record_id.to_string())
        .execute(&self.pool)
        .await?;
        self.get_alert_record(record_id).await?.ok_or(StoreError::NotFound {
            what: "alert record".to_string(),
        })
    }

    /// Record one channel's delivery outcome under the record's row lock.
    pub async fn update_notification_results(
        &self,
        record_id: Uuid,
        channel_id: Uuid,
        success: bool,
        error: Option<&str>,
    ) -> Result<AlertRecord> {
        let lock = self.row_lock(record_id);
        let _guard = lock.lock().await;

        let record = self.get_alert_record(record_id).await?.ok_or(StoreError::NotFound {
            what: "alert record".to_string(),
        })?;
        let mut results = match record.notification_results {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        results.insert(
            channel_id.to_string(),
            serde_json::json!({
                "success": success,
                "error": error,
                "sent_at": Utc::now().to_rfc3339(),
            }),
        );

        sqlx::query("UPDATE alert_records SET notification_results = ? WHERE id = ?")
            .bind(json_text(&serde_json::Value::Object(results)))
            .bind(record_id.to_string())
            .execute(&self.pool)
            .await?;

        self.get_alert_record(record_id).await?.ok_or(StoreError::NotFound {
            what: "alert record".to_string(),
        })
    }
}
