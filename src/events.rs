//! Event router: domain events → matching triggers → new DAG executions.
//!
//! Filters are plain maps: a scalar value must match exactly, a list
//! means membership, and a key absent from the event data never matches.
//! An empty filter matches every event. Event data merged into a new
//! execution's input config is restricted to a whitelist so an event
//! payload cannot override trigger-supplied policy.
//!
//! Duplicate events produce duplicate executions; callers deduplicate
//! upstream. Trigger counters are best-effort statistics.

use std::sync::Arc;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dag::{DagError, DagExecutor};
use crate::queue::{Job, TaskQueue};
use crate::store::{Store, StoreError};
use crate::types::{ExecutionStatus, TriggerType};
use crate::util::merge_configs;

/// Well-known event types emitted by the engine.
pub mod event_types {
    pub const ASSET_CREATED: &str = "asset_created";
    pub const ASSET_UPDATED: &str = "asset_updated";
    pub const SCAN_COMPLETED: &str = "scan_completed";
    pub const SCAN_FAILED: &str = "scan_failed";
    pub const VULN_FOUND: &str = "vuln_found";
    pub const HIGH_RISK_SCORE: &str = "high_risk_score";
}

/// Keys of event data that may flow into a triggered DAG's input config.
const SAFE_EVENT_KEYS: [&str; 7] = [
    "asset_id",
    "asset_type",
    "scan_task_id",
    "task_type",
    "severity",
    "target",
    "source",
];

#[derive(Debug, Error, Diagnostic)]
pub enum EventError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dag(#[from] DagError),
}

/// One DAG started by an event.
#[derive(Clone, Debug)]
pub struct TriggeredDag {
    pub trigger_id: Uuid,
    pub trigger_name: String,
    pub execution_id: Uuid,
    pub dag_template_id: Uuid,
}

/// Result of routing one event.
#[derive(Clone, Debug, Default)]
pub struct EmitOutcome {
    pub matched: usize,
    pub triggered: Vec<TriggeredDag>,
}

/// Does `event_data` satisfy `filter_config`?
pub fn match_filter(filter_config: &Value, event_data: &Value) -> bool {
    let Value::Object(filter) = filter_config else {
        return true;
    };
    if filter.is_empty() {
        return true;
    }
    for (key, expected) in filter {
        let Some(actual) = event_data.get(key) else {
            return false;
        };
        match expected {
            Value::Array(options) => {
                if !options.contains(actual) {
                    return false;
                }
            }
            other => {
                if actual != other {
                    return false;
                }
            }
        }
    }
    true
}

/// Restrict event data to the whitelist before it reaches a DAG's
/// input config.
fn safe_event_data(event_data: &Value) -> Value {
    let mut safe = serde_json::Map::new();
    if let Value::Object(map) = event_data {
        for key in SAFE_EVENT_KEYS {
            if let Some(value) = map.get(key) {
                safe.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(safe)
}

pub struct EventRouter {
    store: Store,
    queue: Arc<TaskQueue>,
}

impl EventRouter {
    pub fn new(store: Store, queue: Arc<TaskQueue>) -> Self {
        EventRouter { store, queue }
    }

    /// Route an event: match triggers, start a DAG execution per match.
    #[instrument(skip(self, event_data), fields(project = %project_id, event = event_type))]
    pub async fn emit(
        &self,
        project_id: Uuid,
        event_type: &str,
        event_data: &Value,
    ) -> Result<EmitOutcome, EventError> {
        let triggers = self
            .store
            .list_enabled_triggers_for_event(project_id, event_type)
            .await?;
        let matching: Vec<_> = triggers
            .into_iter()
            .filter(|t| match_filter(&t.filter_config, event_data))
            .collect();

        let mut outcome = EmitOutcome {
            matched: matching.len(),
            ..Default::default()
        };
        if matching.is_empty() {
            return Ok(outcome);
        }

        let executor = DagExecutor::new(self.store.clone(), self.queue.clone());
        for trigger in matching {
            let template = match self.store.get_dag_template(trigger.dag_template_id).await? {
                Some(t) if t.enabled => t,
                _ => {
                    warn!(trigger = %trigger.id, template = %trigger.dag_template_id,
                        "trigger points at a missing or disabled template");
                    self.store.increment_trigger_count(trigger.id, false).await?;
                    continue;
                }
            };

            let input_config = merge_configs(&safe_event_data(event_data), &trigger.dag_config);
            let trigger_event = serde_json::json!({
                "event_type": event_type,
                "trigger_id": trigger.id.to_string(),
                "trigger_name": trigger.name,
                // Full payload retained for audit.
                "event_data": event_data,
            });

            let started = async {
                let execution = executor
                    .create_execution(
                        project_id,
                        template.id,
                        TriggerType::Event,
                        &trigger_event,
                        &input_config,
                    )
                    .await?;
                self.store
                    .transition_execution_status(
                        execution.id,
                        &[ExecutionStatus::Pending],
                        ExecutionStatus::Running,
                        None,
                    )
                    .await?;
                self.queue.dispatch(
                    Job::ExecuteDag {
                        execution_id: execution.id,
                    },
                    4,
                )
                .map_err(DagError::from)?;
                Ok::<_, EventError>(execution)
            }
            .await;

            match started {
                Ok(execution) => {
                    self.store.increment_trigger_count(trigger.id, true).await?;
                    info!(trigger = %trigger.id, execution = %execution.id, dag = %template.name,
                        "event started dag execution");
                    outcome.triggered.push(TriggeredDag {
                        trigger_id: trigger.id,
                        trigger_name: trigger.name.clone(),
                        execution_id: execution.id,
                        dag_template_id: template.id,
                    });
                }
                Err(e) => {
                    warn!(trigger = %trigger.id, error = %e, "trigger processing failed");
                    self.store.increment_trigger_count(trigger.id, false).await?;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(match_filter(&json!({}), &json!({"a": 1})));
        assert!(match_filter(&json!(null), &json!({})));
    }

    #[test]
    fn scalar_filter_is_equality() {
        let filter = json!({"asset_type": "domain"});
        assert!(match_filter(&filter, &json!({"asset_type": "domain"})));
        assert!(!match_filter(&filter, &json!({"asset_type": "ip"})));
    }

    #[test]
    fn list_filter_is_membership() {
        let filter = json!({"severity": ["high", "critical"]});
        assert!(match_filter(&filter, &json!({"severity": "critical"})));
        assert!(!match_filter(&filter, &json!({"severity": "low"})));
    }

    #[test]
    fn missing_key_never_matches() {
        let filter = json!({"severity": "high"});
        assert!(!match_filter(&filter, &json!({"other": "high"})));
    }

    #[test]
    fn all_filter_keys_must_match() {
        let filter = json!({"asset_type": "domain", "source": "assets_import"});
        assert!(match_filter(
            &filter,
            &json!({"asset_type": "domain", "source": "assets_import", "extra": 1})
        ));
        assert!(!match_filter(
            &filter,
            &json!({"asset_type": "domain", "source": "subfinder"})
        ));
    }

    #[test]
    fn safe_event_data_whitelists_keys() {
        let data = json!({
            "asset_id": "a", "severity": "high",
            "batch_size": 10_000, "priority": 10
        });
        let safe = safe_event_data(&data);
        assert_eq!(safe, json!({"asset_id": "a", "severity": "high"}));
    }
}
