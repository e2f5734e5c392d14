//! Scan lifecycle operations: policy-resolved creation and the guarded
//! start / pause / resume / cancel transitions.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::queue::{Job, TaskQueue};
use crate::store::Store;
use crate::store::models::{ScanPolicy, ScanTask};
use crate::types::{ScanStatus, TaskType, queue_priority};
use crate::util::merge_configs;

use super::ScanError;

/// Parameters for creating a scan task.
#[derive(Clone, Debug)]
pub struct CreateScanRequest {
    pub task_type: TaskType,
    pub config: serde_json::Value,
    pub priority: i64,
    pub policy_id: Option<Uuid>,
}

impl CreateScanRequest {
    pub fn new(task_type: TaskType) -> Self {
        CreateScanRequest {
            task_type,
            config: serde_json::json!({}),
            priority: 5,
            policy_id: None,
        }
    }
}

pub struct ScanService {
    store: Store,
    queue: Arc<TaskQueue>,
}

impl ScanService {
    pub fn new(store: Store, queue: Arc<TaskQueue>) -> Self {
        ScanService { store, queue }
    }

    /// Resolve the effective policy and create a pending task.
    ///
    /// An explicit `policy_id` must belong to the project and be enabled;
    /// otherwise the project default is used, and a disabled default
    /// silently resolves to no policy at all. Effective config is
    /// `policy.scan_config ⊕ request.config` with the request winning.
    #[instrument(skip(self, request), fields(project = %project_id))]
    pub async fn create_scan(
        &self,
        project_id: Uuid,
        request: CreateScanRequest,
    ) -> Result<ScanTask, ScanError> {
        let policy = self.resolve_policy(project_id, request.policy_id).await?;

        let (config, policy_id) = match &policy {
            Some(policy) => (
                merge_configs(&policy.scan_config, &request.config),
                Some(policy.id),
            ),
            None => (request.config.clone(), None),
        };

        let task = self
            .store
            .create_scan_task(
                project_id,
                request.task_type,
                &config,
                request.priority,
                policy_id,
                0,
            )
            .await?;
        info!(task = %task.id, task_type = %task.task_type, "scan task created");
        Ok(task)
    }

    async fn resolve_policy(
        &self,
        project_id: Uuid,
        policy_id: Option<Uuid>,
    ) -> Result<Option<ScanPolicy>, ScanError> {
        match policy_id {
            Some(id) => {
                let policy = self
                    .store
                    .get_scan_policy(id)
                    .await?
                    .filter(|p| p.project_id == project_id)
                    .ok_or(ScanError::PolicyNotFound(id))?;
                if !policy.enabled {
                    return Err(ScanError::PolicyDisabled(id));
                }
                Ok(Some(policy))
            }
            None => {
                let default = self.store.get_default_scan_policy(project_id).await?;
                // A disabled default is not an error; proceed without one.
                Ok(default.filter(|p| p.enabled))
            }
        }
    }

    /// `pending → running`, then dispatch to the scan queue. A failed
    /// dispatch must not leave a running task with no worker: the task
    /// transitions to `failed` with the dispatch error.
    pub async fn start(&self, task_id: Uuid) -> Result<ScanTask, ScanError> {
        let task = self
            .store
            .transition_scan_status(task_id, &[ScanStatus::Pending], ScanStatus::Running, None, None)
            .await?;
        let Some(task) = task else {
            let current = self
                .store
                .get_scan_task(task_id)
                .await?
                .ok_or(ScanError::TaskNotFound(task_id))?;
            return Err(ScanError::Precondition {
                task: task_id,
                from: current.status,
            });
        };

        if let Err(e) = self
            .queue
            .dispatch(Job::RunScan { task_id }, queue_priority(task.priority))
        {
            warn!(task = %task_id, error = %e, "scan dispatch failed");
            let message = e.to_string();
            let failed = self
                .store
                .transition_scan_status(
                    task_id,
                    &[ScanStatus::Running],
                    ScanStatus::Failed,
                    Some(&message),
                    None,
                )
                .await?;
            return failed.ok_or(ScanError::TaskNotFound(task_id));
        }
        Ok(task)
    }

    /// `running → paused`.
    pub async fn pause(&self, task_id: Uuid) -> Result<ScanTask, ScanError> {
        self.guarded(task_id, &[ScanStatus::Running], ScanStatus::Paused).await
    }

    /// `paused → pending`; the task can then be started again.
    pub async fn resume(&self, task_id: Uuid) -> Result<ScanTask, ScanError> {
        self.guarded(task_id, &[ScanStatus::Paused], ScanStatus::Pending).await
    }

    /// Cancel from any non-terminal state; idempotent on an
    /// already-cancelled task. A running worker may finish its current
    /// subprocess, but its eventual status update is ignored.
    pub async fn cancel(&self, task_id: Uuid) -> Result<ScanTask, ScanError> {
        let cancelled = self.store.cancel_scan_task(task_id).await?;
        match cancelled {
            Some(task) => Ok(task),
            None => {
                let current = self
                    .store
                    .get_scan_task(task_id)
                    .await?
                    .ok_or(ScanError::TaskNotFound(task_id))?;
                Err(ScanError::Precondition {
                    task: task_id,
                    from: current.status,
                })
            }
        }
    }

    /// Update config/priority while the task is editable.
    pub async fn update(
        &self,
        task_id: Uuid,
        config: Option<&serde_json::Value>,
        priority: Option<i64>,
    ) -> Result<ScanTask, ScanError> {
        let updated = self.store.update_scan_task(task_id, config, priority).await?;
        match updated {
            Some(task) => Ok(task),
            None => {
                let current = self
                    .store
                    .get_scan_task(task_id)
                    .await?
                    .ok_or(ScanError::TaskNotFound(task_id))?;
                Err(ScanError::Precondition {
                    task: task_id,
                    from: current.status,
                })
            }
        }
    }

    async fn guarded(
        &self,
        task_id: Uuid,
        from: &[ScanStatus],
        to: ScanStatus,
    ) -> Result<ScanTask, ScanError> {
        let task = self
            .store
            .transition_scan_status(task_id, from, to, None, None)
            .await?;
        match task {
            Some(task) => Ok(task),
            None => {
                let current = self
                    .store
                    .get_scan_task(task_id)
                    .await?
                    .ok_or(ScanError::TaskNotFound(task_id))?;
                Err(ScanError::Precondition {
                    task: task_id,
                    from: current.status,
                })
            }
        }
    }
}
