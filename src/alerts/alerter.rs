//! Alert condition checking with aggregation, cooldown, and hourly caps.
//!
//! For a fixed aggregation key, at most one new record is created per
//! cooldown window; observations inside the aggregation window fold into
//! the existing record's `aggregated_count` instead. Each policy also
//! caps how many records it may create per trailing hour.

use std::sync::Arc;

use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::assets::fingerprint::aggregation_key;
use crate::queue::{Job, TaskQueue};
use crate::store::models::AlertPolicy;
use crate::store::{Store, StoreError};
use crate::types::Severity;

#[derive(Debug, Error, Diagnostic)]
pub enum AlertError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened for one qualifying observation across all policies.
#[derive(Clone, Debug, Default)]
pub struct AlertOutcome {
    /// Newly created alert records.
    pub created: Vec<Uuid>,
    /// Records whose aggregated_count was bumped.
    pub aggregated: Vec<Uuid>,
}

pub struct Alerter {
    store: Store,
    queue: Arc<TaskQueue>,
}

impl Alerter {
    pub fn new(store: Store, queue: Arc<TaskQueue>) -> Self {
        Alerter { store, queue }
    }

    /// React to a newly observed vulnerability.
    #[instrument(skip(self, details), fields(project = %project_id, severity = %severity))]
    pub async fn check_vulnerability_alert(
        &self,
        project_id: Uuid,
        vulnerability_id: Uuid,
        severity: Severity,
        title: &str,
        details: &Value,
    ) -> Result<AlertOutcome, AlertError> {
        let key = aggregation_key(project_id, "vulnerability", severity.as_str(), "vuln_found");
        let record_title = format!("[{}] {title}", severity.as_str().to_uppercase());
        let message = format!(
            "Found {} severity vulnerability: {title}",
            severity.as_str().to_uppercase()
        );
        self.evaluate_policies(
            project_id,
            severity,
            None,
            &key,
            "vulnerability",
            Some(vulnerability_id),
            &record_title,
            &message,
            details,
        )
        .await
    }

    /// React to a freshly computed high risk score.
    #[instrument(skip(self), fields(project = %project_id, score = risk_score))]
    pub async fn check_risk_score_alert(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
        risk_score: f64,
        severity_level: Severity,
    ) -> Result<AlertOutcome, AlertError> {
        let key = aggregation_key(project_id, asset_type, severity_level.as_str(), "high_risk");
        let title = format!(
            "[{}] High-risk asset alert",
            severity_level.as_str().to_uppercase()
        );
        let message = format!(
            "Asset risk score is high: {risk_score:.1} ({})",
            severity_level.as_str().to_uppercase()
        );
        let details = json!({ "risk_score": risk_score, "asset_type": asset_type });
        self.evaluate_policies(
            project_id,
            severity_level,
            Some(risk_score),
            &key,
            asset_type,
            Some(asset_id),
            &title,
            &message,
            &details,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_policies(
        &self,
        project_id: Uuid,
        severity: Severity,
        risk_score: Option<f64>,
        key: &str,
        target_type: &str,
        target_id: Option<Uuid>,
        title: &str,
        message: &str,
        details: &Value,
    ) -> Result<AlertOutcome, AlertError> {
        let policies = self.store.list_alert_policies(project_id, Some(true)).await?;
        let mut outcome = AlertOutcome::default();

        for policy in policies {
            if severity < policy.severity_threshold {
                continue;
            }
            if let (Some(score), Some(min)) = (
                risk_score,
                policy.conditions.get("min_risk_score").and_then(Value::as_f64),
            ) {
                if score < min {
                    continue;
                }
            }

            let recent = self
                .store
                .count_recent_alerts(project_id, policy.id, 1)
                .await?;
            if recent >= policy.max_alerts_per_hour {
                info!(policy = %policy.id, "hourly alert cap reached, skipping");
                continue;
            }

            // Aggregate into an open record inside the window before the
            // cooldown is consulted; a fresh burst folds into one record.
            if let Some(existing) = self
                .store
                .find_aggregatable_alert(project_id, key, policy.aggregation_window)
                .await?
            {
                let updated = self.store.increment_aggregated_count(existing.id).await?;
                info!(alert = %existing.id, count = updated.aggregated_count, "aggregated alert");
                outcome.aggregated.push(existing.id);
                continue;
            }

            if self
                .store
                .check_cooldown(project_id, key, policy.cooldown_minutes)
                .await?
            {
                info!(policy = %policy.id, key, "alert in cooldown, skipping");
                continue;
            }

            let record = self
                .store
                .create_alert_record(
                    project_id,
                    Some(policy.id),
                    target_type,
                    target_id,
                    title,
                    message,
                    severity,
                    details,
                    Some(key),
                )
                .await?;
            info!(alert = %record.id, policy = %policy.id, "alert record created");
            outcome.created.push(record.id);

            self.dispatch_notifications(&policy, record.id);
        }

        Ok(outcome)
    }

    fn dispatch_notifications(&self, policy: &AlertPolicy, alert_id: Uuid) {
        if policy.channel_ids.is_empty() {
            return;
        }
        let job = Job::SendNotifications {
            alert_id,
            channel_ids: policy.channel_ids.clone(),
        };
        if let Err(e) = self.queue.dispatch(job, 4) {
            warn!(alert = %alert_id, error = %e, "notification enqueue failed");
        }
    }
}
