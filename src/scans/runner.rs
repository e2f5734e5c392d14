//! Worker-side scan execution.
//!
//! Every handler shares the same skeleton: claim the task, gate on the
//! project rate limit, run the tool (or its fallback), upsert findings,
//! record the result summary, then notify the DAG executor and emit the
//! scan event. Tool and parse errors are caught here and become a
//! `failed` task with a diagnostic message; they never escape to the
//! worker loop.

use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::events::event_types;
use crate::queue::Job;
use crate::ratelimit::DEFAULT_MAX_WAIT;
use crate::store::models::ScanTask;
use crate::types::{ScanStatus, TaskType};

use super::{ScanContext, ScanError};

pub struct ScanRunner {
    ctx: ScanContext,
}

impl ScanRunner {
    pub fn new(ctx: ScanContext) -> Self {
        ScanRunner { ctx }
    }

    /// Entry point for a `RunScan` job.
    #[instrument(skip(self), fields(task = %task_id))]
    pub async fn run(&self, task_id: Uuid) -> Result<(), ScanError> {
        let Some(task) = self.ctx.store.get_scan_task(task_id).await? else {
            error!("scan task not found");
            return Ok(());
        };
        if matches!(task.status, ScanStatus::Paused | ScanStatus::Cancelled) {
            info!(status = %task.status, "task is not runnable, skipping");
            return Ok(());
        }

        // Claim. A task started through the API is already `running`
        // (the start transition happened there); a DAG-dispatched task
        // is still `pending` and is claimed here.
        let task = match self
            .ctx
            .store
            .transition_scan_status(task_id, &[ScanStatus::Pending], ScanStatus::Running, None, None)
            .await?
        {
            Some(claimed) => claimed,
            None => {
                let Some(current) = self.ctx.store.get_scan_task(task_id).await? else {
                    return Ok(());
                };
                if current.status != ScanStatus::Running {
                    info!(status = %current.status, "task no longer runnable, skipping");
                    return Ok(());
                }
                current
            }
        };

        match self.execute(&task).await {
            Ok(summary) => {
                let updated = self
                    .ctx
                    .store
                    .transition_scan_status(
                        task_id,
                        &[ScanStatus::Running],
                        ScanStatus::Completed,
                        None,
                        Some(&summary),
                    )
                    .await?;
                if updated.is_none() {
                    // Cancelled while we were working; the terminal state
                    // absorbs this completion.
                    info!("late completion ignored");
                    return Ok(());
                }
                info!(summary = %summary, "scan task completed");
                self.notify(&task, true, Some(&summary)).await;
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "scan task failed");
                let updated = self
                    .ctx
                    .store
                    .transition_scan_status(
                        task_id,
                        &[ScanStatus::Running],
                        ScanStatus::Failed,
                        Some(&message),
                        None,
                    )
                    .await?;
                if updated.is_none() {
                    info!("late failure ignored");
                    return Ok(());
                }
                self.notify(&task, false, None).await;
            }
        }
        Ok(())
    }

    async fn execute(&self, task: &ScanTask) -> Result<Value, ScanError> {
        let project = self
            .ctx
            .store
            .get_project(task.project_id)
            .await?
            .ok_or_else(|| ScanError::InvalidConfig("project no longer exists".to_string()))?;

        let admitted = self
            .ctx
            .limiters
            .wait_for_project_rate_limit(
                task.project_id,
                &project.rate_limit_config,
                Some(&task.config),
                DEFAULT_MAX_WAIT,
            )
            .await;
        if !admitted {
            return Err(ScanError::RateLimited);
        }

        match task.task_type {
            TaskType::SubdomainScan => super::subdomain::run(&self.ctx, task).await,
            TaskType::DnsResolve => super::dns::run(&self.ctx, task).await,
            TaskType::PortScan => super::ports::run(&self.ctx, task).await,
            TaskType::HttpProbe => super::http_probe::run(&self.ctx, task).await,
            TaskType::Fingerprint => super::fingerprint_task::run(&self.ctx, task).await,
            TaskType::Screenshot => super::screenshot::run(&self.ctx, task).await,
            TaskType::NucleiScan => super::nuclei::run(&self.ctx, task).await,
            TaskType::XrayScan => super::xray::run(&self.ctx, task).await,
            TaskType::JsApiDiscovery => super::js_discovery::run(&self.ctx, task).await,
        }
    }

    /// Best-effort completion fan-out: advance the owning DAG (if any)
    /// and emit the scan event. Neither may break the completion path.
    async fn notify(&self, task: &ScanTask, success: bool, summary: Option<&Value>) {
        match self.ctx.store.find_execution_node_by_task(task.id).await {
            Ok(Some((execution, node_id))) => {
                let job = Job::NodeCompleted {
                    execution_id: execution.id,
                    node_id,
                    success,
                };
                if let Err(e) = self.ctx.queue.dispatch(job, 4) {
                    warn!(task = %task.id, error = %e, "dag completion enqueue failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(task = %task.id, error = %e, "dag completion lookup failed");
            }
        }

        let mut event_data = serde_json::Map::new();
        event_data.insert(
            "scan_task_id".to_string(),
            Value::String(task.id.to_string()),
        );
        event_data.insert(
            "task_type".to_string(),
            Value::String(task.task_type.to_string()),
        );
        if let Some(Value::Object(map)) = summary {
            for (key, value) in map {
                event_data.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        let event_type = if success {
            event_types::SCAN_COMPLETED
        } else {
            event_types::SCAN_FAILED
        };
        let job = Job::ProcessEvent {
            project_id: task.project_id,
            event_type: event_type.to_string(),
            event_data: Value::Object(event_data),
        };
        if let Err(e) = self.ctx.queue.dispatch(job, 4) {
            warn!(task = %task.id, error = %e, "scan event enqueue failed");
        }
    }
}
