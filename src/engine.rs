//! Engine wiring: one `Engine` owns the store, the broker, the limiter
//! pair, and the settings, and hands out the component services. Worker
//! pools are plain tokio tasks pulling a routing class until the queue
//! closes.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::alerts::{Alerter, Notifier};
use crate::config::Settings;
use crate::dag::DagExecutor;
use crate::events::EventRouter;
use crate::queue::{Job, TaskQueue};
use crate::ratelimit::{InMemoryWindowStore, Limiters};
use crate::risk::RiskCalculator;
use crate::scans::{ScanContext, ScanRunner, ScanService};
use crate::store::Store;
use crate::types::QueueClass;

pub struct Engine {
    store: Store,
    queue: Arc<TaskQueue>,
    limiters: Arc<Limiters>,
    settings: Settings,
}

impl Engine {
    pub fn new(store: Store, settings: Settings) -> Arc<Self> {
        Arc::new(Engine {
            store,
            queue: Arc::new(TaskQueue::new()),
            limiters: Arc::new(Limiters::new(Arc::new(InMemoryWindowStore::new()))),
            settings,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn limiters(&self) -> &Arc<Limiters> {
        &self.limiters
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scans(&self) -> ScanService {
        ScanService::new(self.store.clone(), self.queue.clone())
    }

    pub fn dag(&self) -> DagExecutor {
        DagExecutor::new(self.store.clone(), self.queue.clone())
    }

    pub fn events(&self) -> EventRouter {
        EventRouter::new(self.store.clone(), self.queue.clone())
    }

    pub fn alerter(&self) -> Alerter {
        Alerter::new(self.store.clone(), self.queue.clone())
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.store.clone())
    }

    pub fn risk(&self) -> RiskCalculator {
        RiskCalculator::new(self.store.clone(), self.queue.clone())
    }

    fn scan_context(&self) -> ScanContext {
        ScanContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            limiters: self.limiters.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Spawn `count` workers draining one routing class. Workers exit
    /// when the queue closes.
    pub fn spawn_workers(self: &Arc<Self>, class: QueueClass, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let engine = self.clone();
                tokio::spawn(async move {
                    info!(class = %class, worker, "worker started");
                    while let Some(job) = engine.queue.pull(class).await {
                        engine.handle_job(job).await;
                    }
                    info!(class = %class, worker, "worker stopped");
                })
            })
            .collect()
    }

    /// Spawn the default pool layout: one worker per class plus extra
    /// scan capacity.
    pub fn spawn_default_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(self.spawn_workers(QueueClass::Scan, 4));
        handles.extend(self.spawn_workers(QueueClass::Orchestration, 2));
        handles.extend(self.spawn_workers(QueueClass::Alerting, 2));
        handles.extend(self.spawn_workers(QueueClass::Default, 1));
        handles
    }

    /// Stop accepting work; running jobs finish, idle workers exit.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// Execute one job. Job-level failures are logged, never propagated:
    /// a worker loop must not die because one job misbehaved.
    #[instrument(skip(self, job))]
    pub async fn handle_job(&self, job: Job) {
        match job {
            Job::RunScan { task_id } => {
                let runner = ScanRunner::new(self.scan_context());
                if let Err(e) = runner.run(task_id).await {
                    error!(task = %task_id, error = %e, "scan job failed");
                }
            }
            Job::ExecuteDag { execution_id } => {
                if let Err(e) = self.dag().execute(execution_id).await {
                    error!(execution = %execution_id, error = %e, "dag iteration failed");
                }
            }
            Job::NodeCompleted {
                execution_id,
                node_id,
                success,
            } => {
                if let Err(e) = self.dag().on_node_completed(execution_id, &node_id, success).await
                {
                    error!(execution = %execution_id, node = node_id, error = %e,
                        "node completion handling failed");
                }
            }
            Job::ProcessEvent {
                project_id,
                event_type,
                event_data,
            } => {
                if let Err(e) = self.events().emit(project_id, &event_type, &event_data).await {
                    error!(project = %project_id, event = event_type, error = %e,
                        "event routing failed");
                }
            }
            Job::VulnerabilityAlert {
                project_id,
                vulnerability_id,
                severity,
                title,
                details,
            } => {
                if let Err(e) = self
                    .alerter()
                    .check_vulnerability_alert(project_id, vulnerability_id, severity, &title, &details)
                    .await
                {
                    error!(project = %project_id, error = %e, "vulnerability alert check failed");
                }
            }
            Job::RiskScoreAlert {
                project_id,
                asset_type,
                asset_id,
                risk_score,
                severity_level,
            } => {
                if let Err(e) = self
                    .alerter()
                    .check_risk_score_alert(project_id, &asset_type, asset_id, risk_score, severity_level)
                    .await
                {
                    error!(project = %project_id, error = %e, "risk alert check failed");
                }
            }
            Job::SendNotifications {
                alert_id,
                channel_ids,
            } => {
                if let Err(e) = self
                    .notifier()
                    .send_alert_notifications(alert_id, &channel_ids)
                    .await
                {
                    error!(alert = %alert_id, error = %e, "notification dispatch failed");
                }
            }
            Job::RecalculateRisk {
                project_id,
                asset_type,
                asset_ids,
            } => {
                if let Err(e) = self
                    .risk()
                    .calculate_project_risks(project_id, asset_type.as_deref(), &asset_ids)
                    .await
                {
                    error!(project = %project_id, error = %e, "risk recalculation failed");
                }
            }
        }
    }
}
