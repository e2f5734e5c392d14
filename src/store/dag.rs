//! DAG templates, executions, and event triggers.
//!
//! `node_states` / `node_task_ids` / `trigger_count` are JSON aggregates
//! mutated read-modify-write; those writes serialize through the
//! per-row lock registry so two callbacks on the same execution cannot
//! lose updates. Execution status changes use conditional updates like
//! the scan-task state machine.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::types::{ExecutionStatus, NodeState, TriggerType};

use super::models::{DagExecution, DagNode, DagTemplate, EventTrigger, TriggerCount};
use super::{Result, Store, StoreError, json_text, opt_uuid, parse_json, parse_uuid};

fn dag_template_from_row(row: &SqliteRow) -> Result<DagTemplate> {
    let nodes_raw: Option<String> = row.try_get("nodes")?;
    let nodes: Vec<DagNode> = nodes_raw
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            reason: format!("dag_template.nodes: {e}"),
        })?
        .unwrap_or_default();
    Ok(DagTemplate {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "dag_template.id")?,
        project_id: opt_uuid(row.try_get("project_id")?, "dag_template.project_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        nodes,
        is_system: row.try_get("is_system")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dag_execution_from_row(row: &SqliteRow) -> Result<DagExecution> {
    let status_raw: String = row.try_get("status")?;
    let trigger_raw: String = row.try_get("trigger_type")?;
    let trigger_type = match trigger_raw.as_str() {
        "manual" => TriggerType::Manual,
        "event" => TriggerType::Event,
        "schedule" => TriggerType::Schedule,
        other => {
            return Err(StoreError::Corrupt {
                reason: format!("dag_execution.trigger_type: {other:?}"),
            });
        }
    };
    Ok(DagExecution {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "dag_execution.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "dag_execution.project_id",
        )?,
        dag_template_id: parse_uuid(
            &row.try_get::<String, _>("dag_template_id")?,
            "dag_execution.dag_template_id",
        )?,
        trigger_type,
        trigger_event: parse_json(row.try_get("trigger_event")?, serde_json::json!({})),
        status: ExecutionStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
            reason: format!("dag_execution.status: {status_raw:?}"),
        })?,
        node_states: parse_json(row.try_get("node_states")?, serde_json::json!({})),
        node_task_ids: parse_json(row.try_get("node_task_ids")?, serde_json::json!({})),
        input_config: parse_json(row.try_get("input_config")?, serde_json::json!({})),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn event_trigger_from_row(row: &SqliteRow) -> Result<EventTrigger> {
    let counts_raw: Option<String> = row.try_get("trigger_count")?;
    let trigger_count: TriggerCount = counts_raw
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_default();
    Ok(EventTrigger {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "event_trigger.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "event_trigger.project_id",
        )?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        event_type: row.try_get("event_type")?,
        filter_config: parse_json(row.try_get("filter_config")?, serde_json::json!({})),
        dag_template_id: parse_uuid(
            &row.try_get::<String, _>("dag_template_id")?,
            "event_trigger.dag_template_id",
        )?,
        dag_config: parse_json(row.try_get("dag_config")?, serde_json::json!({})),
        enabled: row.try_get("enabled")?,
        trigger_count,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    // -----------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------

    pub async fn create_dag_template(
        &self,
        project_id: Option<Uuid>,
        name: &str,
        description: Option<&str>,
        nodes: &[DagNode],
        is_system: bool,
        enabled: bool,
    ) -> Result<DagTemplate> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let nodes_json = serde_json::to_string(nodes).map_err(|e| StoreError::Corrupt {
            reason: format!("dag template nodes: {e}"),
        })?;
        sqlx::query(
            "INSERT INTO dag_templates
                (id, project_id, name, description, nodes, is_system, enabled,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.map(|v| v.to_string()))
        .bind(name)
        .bind(description)
        .bind(nodes_json)
        .bind(is_system)
        .bind(enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_dag_template(id).await?.ok_or(StoreError::NotFound {
            what: "dag template".to_string(),
        })
    }

    pub async fn get_dag_template(&self, template_id: Uuid) -> Result<Option<DagTemplate>> {
        let row = sqlx::query("SELECT * FROM dag_templates WHERE id = ?")
            .bind(template_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dag_template_from_row).transpose()
    }

    /// Project templates plus the global (`project_id IS NULL`) set.
    pub async fn list_dag_templates(&self, project_id: Uuid) -> Result<Vec<DagTemplate>> {
        let rows = sqlx::query(
            "SELECT * FROM dag_templates
             WHERE project_id = ? OR project_id IS NULL
             ORDER BY created_at DESC",
        )
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dag_template_from_row).collect()
    }

    /// System templates are immutable.
    pub async fn update_dag_template(
        &self,
        template_id: Uuid,
        nodes: Option<&[DagNode]>,
        enabled: Option<bool>,
    ) -> Result<DagTemplate> {
        let existing = self.get_dag_template(template_id).await?.ok_or(StoreError::NotFound {
            what: "dag template".to_string(),
        })?;
        if existing.is_system {
            return Err(StoreError::Conflict {
                reason: "system templates are immutable".to_string(),
            });
        }
        let nodes_json = nodes
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                reason: format!("dag template nodes: {e}"),
            })?;
        sqlx::query(
            "UPDATE dag_templates SET
                nodes = COALESCE(?, nodes),
                enabled = COALESCE(?, enabled),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(nodes_json)
        .bind(enabled)
        .bind(Utc::now())
        .bind(template_id.to_string())
        .execute(&self.pool)
        .await?;

        self.get_dag_template(template_id).await?.ok_or(StoreError::NotFound {
            what: "dag template".to_string(),
        })
    }

    pub async fn delete_dag_template(&self, template_id: Uuid) -> Result<bool> {
        if let Some(existing) = self.get_dag_template(template_id).await? {
            if existing.is_system {
                return Err(StoreError::Conflict {
                    reason: "system templates are immutable".to_string(),
                });
            }
        }
        let affected = sqlx::query("DELETE FROM dag_templates WHERE id = ?")
            .bind(template_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------

    /// Every node starts `pending`.
    pub async fn create_dag_execution(
        &self,
        project_id: Uuid,
        dag_template_id: Uuid,
        trigger_type: TriggerType,
        trigger_event: &serde_json::Value,
        input_config: &serde_json::Value,
        node_ids: &[String],
    ) -> Result<DagExecution> {
        let id = Uuid::new_v4();
        let mut node_states = serde_json::Map::new();
        for node_id in node_ids {
            node_states.insert(
                node_id.clone(),
                serde_json::Value::String(NodeState::Pending.as_str().to_string()),
            );
        }
        sqlx::query(
            "INSERT INTO dag_executions
                (id, project_id, dag_template_id, trigger_type, trigger_event, status,
                 node_states, node_task_ids, input_config, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, '{}', ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(dag_template_id.to_string())
        .bind(trigger_type.as_str())
        .bind(json_text(trigger_event))
        .bind(json_text(&serde_json::Value::Object(node_states)))
        .bind(json_text(input_config))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_dag_execution(id).await?.ok_or(StoreError::NotFound {
            what: "dag execution".to_string(),
        })
    }

    pub async fn get_dag_execution(&self, execution_id: Uuid) -> Result<Option<DagExecution>> {
        let row = sqlx::query("SELECT * FROM dag_executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dag_execution_from_row).transpose()
    }

    pub async fn list_dag_executions(
        &self,
        project_id: Uuid,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> Result<Vec<DagExecution>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM dag_executions WHERE project_id = ? AND status = ?
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
                    "SELECT * FROM dag_executions WHERE project_id = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(dag_execution_from_row).collect()
    }

    /// Guarded execution status change; terminal statuses absorb.
    pub async fn transition_execution_status(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error_message: Option<&str>,
    ) -> Result<Option<DagExecution>> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE dag_executions SET
                status = ?,
                error_message = COALESCE(?, error_message),
                started_at = CASE WHEN ? = 'running' AND started_at IS NULL THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? IN ('completed', 'failed', 'cancelled')
                    THEN COALESCE(completed_at, ?) ELSE completed_at END
             WHERE id = ? AND status IN ({placeholders})"
        );
        let now = Utc::now();
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error_message)
            .bind(to.as_str())
            .bind(now)
            .bind(to.as_str())
            .bind(now)
            .bind(execution_id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }
        let affected = query.execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Ok(None);
        }
        self.get_dag_execution(execution_id).await
    }

    /// Set one node's state (and optionally its dispatched task id)
    /// under the execution's row lock.
    pub async fn update_node_state(
        &self,
        execution_id: Uuid,
        node_id: &str,
        state: NodeState,
        task_id: Option<Uuid>,
    ) -> Result<DagExecution> {
        self.update_node_states_bulk(execution_id, &[(node_id.to_string(), state)], task_id.map(|t| (node_id.to_string(), t)))
            .await
    }

    /// Apply several node-state changes atomically under the row lock.
    pub async fn update_node_states_bulk(
        &self,
        execution_id: Uuid,
        changes: &[(String, NodeState)],
        task_link: Option<(String, Uuid)>,
    ) -> Result<DagExecution> {
        let lock = self.row_lock(execution_id);
        let _guard = lock.lock().await;

        let execution = self.get_dag_execution(execution_id).await?.ok_or(StoreError::NotFound {
            what: "dag execution".to_string(),
        })?;

        let mut states = match execution.node_states {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (node_id, state) in changes {
            states.insert(
                node_id.clone(),
                serde_json::Value::String(state.as_str().to_string()),
            );
        }

        let mut task_ids = match execution.node_task_ids {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some((node_id, task)) = task_link {
            task_ids.insert(node_id, serde_json::Value::String(task.to_string()));
        }

        sqlx::query("UPDATE dag_executions SET node_states = ?, node_task_ids = ? WHERE id = ?")
            .bind(json_text(&serde_json::Value::Object(states)))
            .bind(json_text(&serde_json::Value::Object(task_ids)))
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await?;

        self.get_dag_execution(execution_id).await?.ok_or(StoreError::NotFound {
            what: "dag execution".to_string(),
        })
    }

    /// Reverse index: which execution node dispatched `task_id`?
    /// Tasks not owned by any DAG return `None`.
    pub async fn find_execution_node_by_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<(DagExecution, String)>> {
        let needle = format!("%{task_id}%");
        let rows = sqlx::query("SELECT * FROM dag_executions WHERE node_task_ids LIKE ?")
            .bind(needle)
            .fetch_all(&self.pool)
            .await?;
        let task_str = task_id.to_string();
        for row in &rows {
            let execution = dag_execution_from_row(row)?;
            let mut matched = None;
            if let serde_json::Value::Object(map) = &execution.node_task_ids {
                for (node_id, value) in map {
                    if value.as_str() == Some(task_str.as_str()) {
                        matched = Some(node_id.clone());
                        break;
                    }
                }
            }
            if let Some(node_id) = matched {
                return Ok(Some((execution, node_id)));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------
    // Event triggers
    // -----------------------------------------------------------------

    pub async fn create_event_trigger(
        &self,
        project_id: Uuid,
        name: &str,
        description: Option<&str>,
        event_type: &str,
        filter_config: &serde_json::Value,
        dag_template_id: Uuid,
        dag_config: &serde_json::Value,
        enabled: bool,
    ) -> Result<EventTrigger> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO event_triggers
                (id, project_id, name, description, event_type, filter_config,
                 dag_template_id, dag_config, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(name)
        .bind(description)
        .bind(event_type)
        .bind(json_text(filter_config))
        .bind(dag_template_id.to_string())
        .bind(json_text(dag_config))
        .bind(enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_event_trigger(id).await?.ok_or(StoreError::NotFound {
            what: "event trigger".to_string(),
        })
    }

    pub async fn get_event_trigger(&self, trigger_id: Uuid) -> Result<Option<EventTrigger>> {
        let row = sqlx::query("SELECT * FROM event_triggers WHERE id = ?")
            .bind(trigger_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_trigger_from_row).transpose()
    }

    pub async fn list_event_triggers(&self, project_id: Uuid) -> Result<Vec<EventTrigger>> {
        let rows = sqlx::query(
            "SELECT * FROM event_triggers WHERE project_id = ? ORDER BY created_at DESC",
        )
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_trigger_from_row).collect()
    }

    /// All enabled triggers for `(project, event_type)`.
    pub async fn list_enabled_triggers_for_event(
        &self,
        project_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<EventTrigger>> {
        let rows = sqlx::query(
            "SELECT * FROM event_triggers
             WHERE project_id = ? AND event_type = ? AND enabled = 1",
        )
        .bind(project_id.to_string())
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_trigger_from_row).collect()
    }

    pub async fn delete_event_trigger(&self, trigger_id: Uuid) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM event_triggers WHERE id = ?")
            .bind(trigger_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Best-effort counters, serialized by the row lock.
    pub async fn increment_trigger_count(&self, trigger_id: Uuid, success: bool) -> Result<()> {
        let lock = self.row_lock(trigger_id);
        let _guard = lock.lock().await;

        let Some(trigger) = self.get_event_trigger(trigger_id).await? else {
            return Ok(());
        };
        let mut counts = trigger.trigger_count;
        counts.total += 1;
        if success {
            counts.success += 1;
        } else {
            counts.failed += 1;
        }
        let counts_json = serde_json::to_string(&counts).map_err(|e| StoreError::Corrupt {
            reason: format!("trigger_count: {e}"),
        })?;
        sqlx::query("UPDATE event_triggers SET trigger_count = ? WHERE id = ?")
            .bind(counts_json)
            .bind(trigger_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
