//! Asset risk scoring.
//!
//! A score is the weighted average of its factor scores, clipped to
//! `[0, 100]`, banded into severity levels. Built-in factor kinds are
//! `vulnerability` (severity-weighted finding counts) and `exposure`
//! (open ports with a premium on high-risk services); custom factors
//! evaluate a small declarative `calculation_rule`.

use std::sync::Arc;

use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::queue::{Job, TaskQueue};
use crate::store::models::AssetRiskScore;
use crate::store::{Store, StoreError};
use crate::types::Severity;

#[derive(Debug, Error, Diagnostic)]
pub enum RiskError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ports whose exposure carries an extra premium.
const HIGH_RISK_PORTS: [u16; 10] = [22, 23, 25, 445, 3389, 1433, 3306, 5432, 6379, 27017];

const SCORE_TTL_HOURS: i64 = 24;
const MAX_SWEEP_ASSETS: usize = 1000;

/// Band a 0..=100 score into a severity level.
pub fn score_to_severity(score: f64) -> Severity {
    if score >= 80.0 {
        Severity::Critical
    } else if score >= 60.0 {
        Severity::High
    } else if score >= 40.0 {
        Severity::Medium
    } else if score >= 20.0 {
        Severity::Low
    } else {
        Severity::Info
    }
}

/// A factor to evaluate, resolved from stored rows or the defaults.
#[derive(Clone, Debug)]
pub struct FactorSpec {
    pub id: String,
    pub name: String,
    pub factor_type: String,
    pub weight: f64,
    pub max_score: i64,
    pub calculation_rule: Value,
}

fn default_factors() -> Vec<FactorSpec> {
    vec![
        FactorSpec {
            id: "vulnerability".to_string(),
            name: "vulnerability".to_string(),
            factor_type: "vulnerability".to_string(),
            weight: 0.6,
            max_score: 100,
            calculation_rule: json!({}),
        },
        FactorSpec {
            id: "exposure".to_string(),
            name: "exposure".to_string(),
            factor_type: "exposure".to_string(),
            weight: 0.4,
            max_score: 100,
            calculation_rule: json!({}),
        },
    ]
}

pub struct RiskCalculator {
    store: Store,
    queue: Arc<TaskQueue>,
}

impl RiskCalculator {
    pub fn new(store: Store, queue: Arc<TaskQueue>) -> Self {
        RiskCalculator { store, queue }
    }

    /// Compute and persist one asset's score; a high or critical result
    /// enqueues an alert check.
    #[instrument(skip(self, factors), fields(project = %project_id, asset = %asset_id))]
    pub async fn calculate_asset_risk(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
        factors: &[FactorSpec],
    ) -> Result<AssetRiskScore, RiskError> {
        let mut factor_scores = serde_json::Map::new();
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut highest: Option<(String, f64)> = None;

        for factor in factors {
            let (score, details) = self
                .evaluate_factor(project_id, asset_type, asset_id, factor)
                .await?;
            let score = score.min(factor.max_score as f64).max(0.0);

            if highest.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                highest = Some((factor.id.clone(), score));
            }
            factor_scores.insert(
                factor.id.clone(),
                json!({
                    "score": score,
                    "weight": factor.weight,
                    "weighted_score": score * factor.weight,
                    "details": details,
                }),
            );
            weighted_sum += score * factor.weight;
            total_weight += factor.weight;
        }

        let total_score = if total_weight > 0.0 {
            (weighted_sum / total_weight).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let total_score = (total_score * 100.0).round() / 100.0;
        let severity_level = score_to_severity(total_score);

        let risk_summary = json!({
            "total_factors": factor_scores.len(),
            "highest_factor": highest.map(|(id, _)| id),
        });

        let stored = self
            .store
            .upsert_risk_score(
                project_id,
                asset_type,
                asset_id,
                total_score,
                severity_level,
                &Value::Object(factor_scores),
                &risk_summary,
                Some(chrono::Utc::now() + chrono::Duration::hours(SCORE_TTL_HOURS)),
            )
            .await?;

        if severity_level >= Severity::High {
            let job = Job::RiskScoreAlert {
                project_id,
                asset_type: asset_type.to_string(),
                asset_id,
                risk_score: total_score,
                severity_level,
            };
            if let Err(e) = self.queue.dispatch(job, 4) {
                warn!(error = %e, "risk alert enqueue failed");
            }
        }

        Ok(stored)
    }

    /// Project-wide sweep. Uses the project's enabled factors (plus
    /// system factors) or the built-in defaults when none exist; bounded
    /// to 1000 assets per run.
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn calculate_project_risks(
        &self,
        project_id: Uuid,
        asset_type: Option<&str>,
        asset_ids: &[Uuid],
    ) -> Result<Vec<AssetRiskScore>, RiskError> {
        let stored_factors = self.store.list_risk_factors(project_id, true).await?;
        let factors: Vec<FactorSpec> = if stored_factors.is_empty() {
            default_factors()
        } else {
            stored_factors
                .into_iter()
                .map(|f| FactorSpec {
                    id: f.id.to_string(),
                    name: f.name,
                    factor_type: f.factor_type,
                    weight: f.weight,
                    max_score: f.max_score,
                    calculation_rule: f.calculation_rule,
                })
                .collect()
        };

        let assets: Vec<(String, Uuid)> = if asset_ids.is_empty() {
            self.store.list_asset_refs(project_id, asset_type).await?
        } else {
            let kind = asset_type.unwrap_or("unknown").to_string();
            asset_ids.iter().map(|id| (kind.clone(), *id)).collect()
        };

        if assets.len() > MAX_SWEEP_ASSETS {
            warn!(
                total = assets.len(),
                cap = MAX_SWEEP_ASSETS,
                "risk sweep truncated to cap"
            );
        }

        let mut scores = Vec::new();
        for (kind, id) in assets.into_iter().take(MAX_SWEEP_ASSETS) {
            match self
                .calculate_asset_risk(project_id, &kind, id, &factors)
                .await
            {
                Ok(score) => scores.push(score),
                Err(e) => warn!(asset = %id, error = %e, "asset risk calculation failed"),
            }
        }
        info!(calculated = scores.len(), "risk sweep finished");
        Ok(scores)
    }

    async fn evaluate_factor(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
        factor: &FactorSpec,
    ) -> Result<(f64, Value), RiskError> {
        match factor.factor_type.as_str() {
            "vulnerability" => self.vulnerability_factor(project_id, asset_type, asset_id).await,
            "exposure" => self.exposure_factor(project_id, asset_type, asset_id).await,
            _ => {
                self.custom_factor(project_id, asset_type, asset_id, &factor.calculation_rule)
                    .await
            }
        }
    }

    /// `40·critical + 20·high + 10·medium + 5·low`, capped at 100.
    async fn vulnerability_factor(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
    ) -> Result<(f64, Value), RiskError> {
        let counts = self
            .store
            .count_vulnerabilities_by_severity(project_id, Some(asset_type), Some(asset_id))
            .await?;
        let count = |s: Severity| *counts.get(&s).unwrap_or(&0) as f64;

        let score = (40.0 * count(Severity::Critical)
            + 20.0 * count(Severity::High)
            + 10.0 * count(Severity::Medium)
            + 5.0 * count(Severity::Low))
        .min(100.0);

        let details = json!({
            "vulnerability_counts": {
                "critical": count(Severity::Critical),
                "high": count(Severity::High),
                "medium": count(Severity::Medium),
                "low": count(Severity::Low),
                "info": count(Severity::Info),
            },
            "total_vulnerabilities": counts.values().sum::<u32>(),
        });
        Ok((score, details))
    }

    /// `min(open_ports · 2, 40) + 10 · high_risk_ports`, capped at 100.
    async fn exposure_factor(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
    ) -> Result<(f64, Value), RiskError> {
        let ip_filter = if asset_type == "ip_address" {
            Some(asset_id)
        } else {
            None
        };
        let ports = self.store.list_open_port_numbers(project_id, ip_filter).await?;
        let open = ports.len() as f64;
        let high_risk = ports
            .iter()
            .filter(|p| HIGH_RISK_PORTS.contains(p))
            .count() as f64;

        let score = ((open * 2.0).min(40.0) + high_risk * 10.0).min(100.0);
        let details = json!({
            "open_ports": open,
            "high_risk_ports": high_risk,
        });
        Ok((score, details))
    }

    /// Declarative rule: `base_score + per_open_port·open_ports +
    /// per_vulnerability·total_vulnerabilities`.
    async fn custom_factor(
        &self,
        project_id: Uuid,
        asset_type: &str,
        asset_id: Uuid,
        rule: &Value,
    ) -> Result<(f64, Value), RiskError> {
        let base = rule.get("base_score").and_then(Value::as_f64).unwrap_or(0.0);
        let per_port = rule.get("per_open_port").and_then(Value::as_f64).unwrap_or(0.0);
        let per_vuln = rule
            .get("per_vulnerability")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let mut score = base;
        let mut details = serde_json::Map::new();
        details.insert("base_score".to_string(), json!(base));

        if per_port != 0.0 {
            let ip_filter = if asset_type == "ip_address" {
                Some(asset_id)
            } else {
                None
            };
            let open = self
                .store
                .list_open_port_numbers(project_id, ip_filter)
                .await?
                .len() as f64;
            score += per_port * open;
            details.insert("open_ports".to_string(), json!(open));
        }
        if per_vuln != 0.0 {
            let counts = self
                .store
                .count_vulnerabilities_by_severity(project_id, Some(asset_type), Some(asset_id))
                .await?;
            let total: u32 = counts.values().sum();
            score += per_vuln * total as f64;
            details.insert("total_vulnerabilities".to_string(), json!(total));
        }

        Ok((score.max(0.0), Value::Object(details)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(score_to_severity(100.0), Severity::Critical);
        assert_eq!(score_to_severity(80.0), Severity::Critical);
        assert_eq!(score_to_severity(79.9), Severity::High);
        assert_eq!(score_to_severity(60.0), Severity::High);
        assert_eq!(score_to_severity(40.0), Severity::Medium);
        assert_eq!(score_to_severity(20.0), Severity::Low);
        assert_eq!(score_to_severity(19.9), Severity::Info);
        assert_eq!(score_to_severity(0.0), Severity::Info);
    }

    #[test]
    fn defaults_weigh_vulnerability_over_exposure() {
        let factors = default_factors();
        assert_eq!(factors.len(), 2);
        assert!(factors[0].weight > factors[1].weight);
        assert_eq!(factors[0].factor_type, "vulnerability");
    }
}
