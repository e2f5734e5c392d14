//! Persisted record types.
//!
//! Every observation row carries `first_seen`/`last_seen` and a
//! project-scoped `fingerprint_hash`; upserts bump `last_seen` and never
//! rewind `first_seen`. JSON aggregates are carried as
//! `serde_json::Value` and schema-validated at the API boundary, never
//! interpreted as templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ExecutionStatus, ScanStatus, Severity, TaskType, TriggerType};

/// Root tenancy scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub rate_limit_config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generic imported asset, deduplicated by `(asset_type, value)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetEntity {
    pub id: Uuid,
    pub project_id: Uuid,
    pub asset_type: String,
    pub value: String,
    pub source: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subdomain {
    pub id: Uuid,
    pub project_id: Uuid,
    pub root_domain: String,
    pub subdomain: String,
    pub source: String,
    pub ip_addresses: Vec<String>,
    pub cname: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: Uuid,
    pub project_id: Uuid,
    pub ip: String,
    pub source: String,
    pub country: Option<String>,
    pub org: Option<String>,
    pub is_cdn: bool,
    pub fingerprint_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Port {
    pub id: Uuid,
    pub ip_id: Uuid,
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: Option<String>,
    pub banner: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebAsset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub ip_id: Option<Uuid>,
    pub port_id: Option<Uuid>,
    pub title: Option<String>,
    pub status_code: Option<u16>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub server: Option<String>,
    pub technologies: Vec<String>,
    pub is_alive: bool,
    pub screenshot_path: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsAsset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub web_asset_id: Option<Uuid>,
    pub script_url: String,
    pub script_type: String,
    pub content_hash: String,
    pub source_url: Option<String>,
    pub scan_metadata: Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: Uuid,
    pub project_id: Uuid,
    pub js_asset_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub host: Option<String>,
    pub evidence: Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: Uuid,
    pub project_id: Uuid,
    pub target_url: String,
    pub template_id: String,
    pub template_name: Option<String>,
    pub severity: Severity,
    pub vuln_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub reference: Vec<String>,
    pub tags: Vec<String>,
    pub matched_at: Option<String>,
    pub matcher_name: Option<String>,
    pub extracted_results: Vec<String>,
    pub curl_command: Option<String>,
    pub request: Option<String>,
    pub response: Option<String>,
    pub scan_task_id: Option<Uuid>,
    pub target_type: Option<String>,
    pub target_id: Option<Uuid>,
    pub raw_output: Option<Value>,
    pub fingerprint_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiRiskFinding {
    pub id: Uuid,
    pub project_id: Uuid,
    pub endpoint_id: Option<Uuid>,
    pub rule_name: String,
    pub severity: Severity,
    pub title: Option<String>,
    pub description: Option<String>,
    pub evidence: Value,
    pub status: String,
    pub status_history: Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: Uuid,
    pub project_id: Uuid,
    pub scan_policy_id: Option<Uuid>,
    pub task_type: TaskType,
    pub status: ScanStatus,
    pub priority: i64,
    pub progress: i64,
    pub total_targets: i64,
    pub completed_targets: i64,
    pub config: Value,
    pub result_summary: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub scan_config: Value,
    pub dag_template_id: Option<Uuid>,
    pub is_default: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One node of a DAG template: a task type plus its dependencies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagTemplate {
    pub id: Uuid,
    /// `None` marks a global (system-shipped) template.
    pub project_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<DagNode>,
    pub is_system: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagExecution {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dag_template_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_event: Value,
    pub status: ExecutionStatus,
    /// node id → state, as snake_case strings.
    pub node_states: Value,
    /// node id → dispatched scan-task id.
    pub node_task_ids: Value,
    pub input_config: Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Best-effort trigger statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCount {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventTrigger {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub event_type: String,
    pub filter_config: Value,
    pub dag_template_id: Uuid,
    pub dag_config: Value,
    pub enabled: bool,
    pub trigger_count: TriggerCount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskFactor {
    pub id: Uuid,
    /// `None` marks a system-wide factor.
    pub project_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub factor_type: String,
    pub weight: f64,
    pub max_score: i64,
    pub calculation_rule: Value,
    pub is_system: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetRiskScore {
    pub id: Uuid,
    pub project_id: Uuid,
    pub asset_type: String,
    pub asset_id: Uuid,
    pub total_score: f64,
    pub severity_level: Severity,
    pub factor_scores: Value,
    pub risk_summary: Value,
    pub calculated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub channel_type: String,
    /// Opaque channel configuration; only the notifier worker reads it.
    pub config: Value,
    pub enabled: bool,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_test_success: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub conditions: Value,
    pub severity_threshold: Severity,
    pub channel_ids: Vec<Uuid>,
    pub notification_template: Option<String>,
    pub cooldown_minutes: i64,
    pub aggregation_window: i64,
    pub max_alerts_per_hour: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub policy_id: Option<Uuid>,
    pub target_type: String,
    pub target_id: Option<Uuid>,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub details: Value,
    pub status: String,
    pub aggregation_key: Option<String>,
    pub aggregated_count: i64,
    /// channel id → `{success, error, sent_at}`.
    pub notification_results: Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}
