//! The DAG execution engine.
//!
//! `execute` runs one re-entrant iteration: compute the ready set,
//! dispatch ready nodes as scan tasks, cascade skips behind failures, and
//! detect termination. Every node completion calls back through
//! [`DagExecutor::on_node_completed`], which records the state change and
//! enqueues the next iteration. It is always safe to run another
//! iteration after any state change.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::queue::{Job, QueueError, TaskQueue};
use crate::store::models::{DagExecution, DagNode};
use crate::store::{Store, StoreError};
use crate::types::{ExecutionStatus, NodeState, TriggerType, queue_priority};
use crate::util::{json_i64, merge_configs};

use super::template::{TemplateError, dependency_graph, validate_nodes};

#[derive(Debug, Error, Diagnostic)]
pub enum DagError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("dag execution {0} not found")]
    #[diagnostic(code(recongraph::dag::execution_not_found))]
    ExecutionNotFound(Uuid),

    #[error("dag template {0} not found")]
    #[diagnostic(code(recongraph::dag::template_not_found))]
    TemplateNotFound(Uuid),

    #[error("execution {execution}: illegal transition from {from}")]
    #[diagnostic(code(recongraph::dag::precondition))]
    Precondition {
        execution: Uuid,
        from: ExecutionStatus,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of one executor iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionProgress {
    /// Ready nodes were dispatched; the listed node ids went running.
    Dispatched(Vec<String>),
    /// Nothing ready, at least one node still running.
    Waiting,
    /// Every node terminal, none failed.
    Completed,
    /// Every node terminal, at least one failed.
    Failed,
    /// The execution was cancelled; no further dispatch.
    Halted,
}

pub struct DagExecutor {
    store: Store,
    queue: Arc<TaskQueue>,
}

fn node_states_map(execution: &DagExecution, nodes: &[DagNode]) -> FxHashMap<String, NodeState> {
    let mut states = FxHashMap::default();
    if let serde_json::Value::Object(map) = &execution.node_states {
        for (node_id, value) in map {
            let state = match value.as_str() {
                Some("pending") => NodeState::Pending,
                Some("running") => NodeState::Running,
                Some("completed") => NodeState::Completed,
                Some("failed") => NodeState::Failed,
                Some("skipped") => NodeState::Skipped,
                _ => NodeState::Pending,
            };
            states.insert(node_id.clone(), state);
        }
    }
    for node in nodes {
        states.entry(node.id.clone()).or_insert(NodeState::Pending);
    }
    states
}

fn ready_nodes<'a>(
    nodes: &'a [DagNode],
    states: &FxHashMap<String, NodeState>,
    deps: &FxHashMap<String, FxHashSet<String>>,
) -> Vec<&'a DagNode> {
    nodes
        .iter()
        .filter(|node| states.get(&node.id) == Some(&NodeState::Pending))
        .filter(|node| {
            deps.get(&node.id)
                .map(|d| d.iter().all(|dep| states.get(dep) == Some(&NodeState::Completed)))
                .unwrap_or(true)
        })
        .collect()
}

/// Mark pending nodes blocked by a failed or skipped dependency as
/// skipped, cascading until a fixpoint so a whole blocked chain settles
/// in one pass.
fn cascade_skips(
    nodes: &[DagNode],
    states: &mut FxHashMap<String, NodeState>,
    deps: &FxHashMap<String, FxHashSet<String>>,
) -> Vec<String> {
    let mut skipped = Vec::new();
    loop {
        let mut changed = false;
        for node in nodes {
            if states.get(&node.id) != Some(&NodeState::Pending) {
                continue;
            }
            let blocked = deps
                .get(&node.id)
                .map(|d| {
                    d.iter().any(|dep| {
                        matches!(
                            states.get(dep),
                            Some(NodeState::Failed) | Some(NodeState::Skipped)
                        )
                    })
                })
                .unwrap_or(false);
            if blocked {
                states.insert(node.id.clone(), NodeState::Skipped);
                skipped.push(node.id.clone());
                changed = true;
            }
        }
        if !changed {
            return skipped;
        }
    }
}

fn check_complete(states: &FxHashMap<String, NodeState>) -> (bool, bool) {
    if states.is_empty() {
        return (false, false);
    }
    let all_terminal = states.values().all(|s| s.is_terminal());
    let has_failure = states.values().any(|s| *s == NodeState::Failed);
    (all_terminal, all_terminal && !has_failure)
}

impl DagExecutor {
    pub fn new(store: Store, queue: Arc<TaskQueue>) -> Self {
        DagExecutor { store, queue }
    }

    /// Create an execution for `template_id` with every node pending.
    /// The template is re-validated here: user-authored graphs are
    /// refused if cyclic.
    pub async fn create_execution(
        &self,
        project_id: Uuid,
        template_id: Uuid,
        trigger_type: TriggerType,
        trigger_event: &serde_json::Value,
        input_config: &serde_json::Value,
    ) -> Result<DagExecution, DagError> {
        let template = self
            .store
            .get_dag_template(template_id)
            .await?
            .ok_or(DagError::TemplateNotFound(template_id))?;
        validate_nodes(&template.nodes)?;

        let node_ids: Vec<String> = template.nodes.iter().map(|n| n.id.clone()).collect();
        let execution = self
            .store
            .create_dag_execution(
                project_id,
                template_id,
                trigger_type,
                trigger_event,
                input_config,
                &node_ids,
            )
            .await?;
        Ok(execution)
    }

    /// `pending → running`, then enqueue the first iteration.
    pub async fn start(&self, execution_id: Uuid) -> Result<DagExecution, DagError> {
        let execution = self
            .store
            .transition_execution_status(
                execution_id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                None,
            )
            .await?;
        let Some(execution) = execution else {
            let current = self
                .store
                .get_dag_execution(execution_id)
                .await?
                .ok_or(DagError::ExecutionNotFound(execution_id))?;
            return Err(DagError::Precondition {
                execution: execution_id,
                from: current.status,
            });
        };
        self.queue.dispatch(Job::ExecuteDag { execution_id }, 4)?;
        Ok(execution)
    }

    /// Cancel: terminal and absorbing, halts further dispatch. Node tasks
    /// already running follow scan-cancellation rules on their own.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<DagExecution, DagError> {
        let execution = self
            .store
            .transition_execution_status(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Cancelled,
                None,
            )
            .await?;
        match execution {
            Some(execution) => Ok(execution),
            None => {
                let current = self
                    .store
                    .get_dag_execution(execution_id)
                    .await?
                    .ok_or(DagError::ExecutionNotFound(execution_id))?;
                if current.status == ExecutionStatus::Cancelled {
                    Ok(current)
                } else {
                    Err(DagError::Precondition {
                        execution: execution_id,
                        from: current.status,
                    })
                }
            }
        }
    }

    /// One executor iteration. Re-entrant; called after every node state
    /// change.
    #[instrument(skip(self), fields(execution = %execution_id))]
    pub async fn execute(&self, execution_id: Uuid) -> Result<ExecutionProgress, DagError> {
        let execution = self
            .store
            .get_dag_execution(execution_id)
            .await?
            .ok_or(DagError::ExecutionNotFound(execution_id))?;

        if execution.status == ExecutionStatus::Cancelled {
            return Ok(ExecutionProgress::Halted);
        }
        if execution.status.is_terminal() {
            return Ok(match execution.status {
                ExecutionStatus::Completed => ExecutionProgress::Completed,
                _ => ExecutionProgress::Failed,
            });
        }

        let template = match self.store.get_dag_template(execution.dag_template_id).await? {
            Some(t) => t,
            None => {
                self.fail_execution(execution_id, "Template not found").await?;
                return Ok(ExecutionProgress::Failed);
            }
        };

        if template.nodes.is_empty() {
            self.store
                .transition_execution_status(
                    execution_id,
                    &[ExecutionStatus::Pending, ExecutionStatus::Running],
                    ExecutionStatus::Completed,
                    None,
                )
                .await?;
            return Ok(ExecutionProgress::Completed);
        }

        if let Err(e) = validate_nodes(&template.nodes) {
            self.fail_execution(execution_id, &e.to_string()).await?;
            return Ok(ExecutionProgress::Failed);
        }

        let deps = dependency_graph(&template.nodes);
        let mut states = node_states_map(&execution, &template.nodes);
        let ready = ready_nodes(&template.nodes, &states, &deps);

        if ready.is_empty() {
            let skipped = cascade_skips(&template.nodes, &mut states, &deps);
            if !skipped.is_empty() {
                let changes: Vec<(String, NodeState)> = skipped
                    .iter()
                    .map(|id| (id.clone(), NodeState::Skipped))
                    .collect();
                self.store
                    .update_node_states_bulk(execution_id, &changes, None)
                    .await?;
            }

            let (complete, success) = check_complete(&states);
            if complete {
                let status = if success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                self.store
                    .transition_execution_status(
                        execution_id,
                        &[ExecutionStatus::Pending, ExecutionStatus::Running],
                        status,
                        None,
                    )
                    .await?;
                info!(%execution_id, status = %status, "dag execution finished");
                return Ok(if success {
                    ExecutionProgress::Completed
                } else {
                    ExecutionProgress::Failed
                });
            }
            return Ok(ExecutionProgress::Waiting);
        }

        let mut dispatched = Vec::new();
        for node in ready {
            let node_config = merge_configs(&execution.input_config, &node.config);
            let priority = json_i64(&node_config, "priority", 5);

            let task = match self
                .store
                .create_scan_task(execution.project_id, node.task_type, &node_config, priority, None, 0)
                .await
            {
                Ok(task) => task,
                Err(e) => {
                    error!(node = %node.id, error = %e, "dag node task creation failed");
                    self.store
                        .update_node_state(execution_id, &node.id, NodeState::Failed, None)
                        .await?;
                    continue;
                }
            };

            // Record the node→task link before the job can be picked up,
            // so a fast worker's completion lookup always finds it.
            self.store
                .update_node_state(execution_id, &node.id, NodeState::Running, Some(task.id))
                .await?;

            match self
                .queue
                .dispatch(Job::RunScan { task_id: task.id }, queue_priority(priority))
            {
                Ok(()) => {
                    info!(node = %node.id, task = %task.id, "dispatched dag node");
                    dispatched.push(node.id.clone());
                }
                Err(e) => {
                    error!(node = %node.id, error = %e, "dag node dispatch failed");
                    self.store
                        .update_node_state(execution_id, &node.id, NodeState::Failed, None)
                        .await?;
                }
            }
        }

        Ok(ExecutionProgress::Dispatched(dispatched))
    }

    /// The scan→DAG bridge: record the node result and enqueue the next
    /// iteration asynchronously.
    pub async fn on_node_completed(
        &self,
        execution_id: Uuid,
        node_id: &str,
        success: bool,
    ) -> Result<(), DagError> {
        let state = if success {
            NodeState::Completed
        } else {
            NodeState::Failed
        };
        self.store
            .update_node_state(execution_id, node_id, state, None)
            .await?;

        if let Err(e) = self.queue.dispatch(Job::ExecuteDag { execution_id }, 4) {
            warn!(%execution_id, error = %e, "could not enqueue dag iteration");
        }
        Ok(())
    }

    async fn fail_execution(&self, execution_id: Uuid, message: &str) -> Result<(), DagError> {
        self.store
            .transition_execution_status(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Failed,
                Some(message),
            )
            .await?;
        Ok(())
    }
}
