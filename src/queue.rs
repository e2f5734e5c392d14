//! Priority-aware pull queue with named routing classes.
//!
//! Jobs are routed by family (`default`, `scan`, `orchestration`,
//! `alerting`) so each worker pool drains one class. Within a class,
//! higher priority (internal 0..=9) drains first and equal priorities
//! drain FIFO. API-level priorities 1..=10 are mapped down by
//! [`crate::types::queue_priority`].
//!
//! Wakeups ride a flume token channel: every push sends one token, every
//! pull consumes one, so a sleeping worker wakes exactly when an entry
//! exists. `close` starts a chain of wake tokens so all blocked workers
//! drain out.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{QueueClass, Severity};

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("task queue is closed")]
    #[diagnostic(code(recongraph::queue::closed))]
    Closed,
}

/// A unit of work the worker pools execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Job {
    /// Execute a scan task through its per-type handler.
    RunScan { task_id: Uuid },
    /// Run one iteration of the DAG executor.
    ExecuteDag { execution_id: Uuid },
    /// A DAG node's scan finished; advance the execution.
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        success: bool,
    },
    /// Match an emitted domain event against triggers.
    ProcessEvent {
        project_id: Uuid,
        event_type: String,
        event_data: serde_json::Value,
    },
    /// Check alert policies for a new vulnerability.
    VulnerabilityAlert {
        project_id: Uuid,
        vulnerability_id: Uuid,
        severity: Severity,
        title: String,
        details: serde_json::Value,
    },
    /// Check alert policies for a freshly computed risk score.
    RiskScoreAlert {
        project_id: Uuid,
        asset_type: String,
        asset_id: Uuid,
        risk_score: f64,
        severity_level: Severity,
    },
    /// Deliver an alert record to its channels.
    SendNotifications {
        alert_id: Uuid,
        channel_ids: Vec<Uuid>,
    },
    /// Recompute risk scores for a project's assets.
    RecalculateRisk {
        project_id: Uuid,
        asset_type: Option<String>,
        asset_ids: Vec<Uuid>,
    },
}

impl Job {
    /// Which worker pool drains this job.
    pub fn class(&self) -> QueueClass {
        match self {
            Job::RunScan { .. } => QueueClass::Scan,
            Job::ExecuteDag { .. } | Job::NodeCompleted { .. } | Job::ProcessEvent { .. } => {
                QueueClass::Orchestration
            }
            Job::VulnerabilityAlert { .. }
            | Job::RiskScoreAlert { .. }
            | Job::SendNotifications { .. } => QueueClass::Alerting,
            Job::RecalculateRisk { .. } => QueueClass::Default,
        }
    }
}

struct Entry {
    priority: u8,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, lower seq (older) first within
        // a priority level.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ClassQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl ClassQueue {
    fn new() -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        ClassQueue {
            heap: Mutex::new(BinaryHeap::new()),
            wake_tx,
            wake_rx,
        }
    }
}

/// The broker all worker pools pull from.
pub struct TaskQueue {
    classes: FxHashMap<QueueClass, ClassQueue>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let mut classes = FxHashMap::default();
        for class in QueueClass::ALL {
            classes.insert(class, ClassQueue::new());
        }
        TaskQueue {
            classes,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn class_queue(&self, class: QueueClass) -> &ClassQueue {
        // Every class is inserted in new(); the map never changes after.
        self.classes.get(&class).unwrap_or_else(|| unreachable!())
    }

    /// Enqueue `job` on its routing class at internal priority 0..=9.
    pub fn dispatch(&self, job: Job, priority: u8) -> Result<(), QueueError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let class = self.class_queue(job.class());
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        class.heap.lock().push(Entry {
            priority: priority.min(9),
            seq,
            job,
        });
        let _ = class.wake_tx.send(());
        Ok(())
    }

    /// Pull the next job for `class`, waiting until one is available.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pull(&self, class: QueueClass) -> Option<Job> {
        let queue = self.class_queue(class);
        loop {
            if let Some(entry) = queue.heap.lock().pop() {
                return Some(entry.job);
            }
            if self.closed.load(AtomicOrdering::SeqCst) {
                // Chain-wake the next blocked worker so the pool drains.
                let _ = queue.wake_tx.send(());
                return None;
            }
            if queue.wake_rx.recv_async().await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking pull.
    pub fn try_pull(&self, class: QueueClass) -> Option<Job> {
        self.class_queue(class).heap.lock().pop().map(|e| e.job)
    }

    pub fn len(&self, class: QueueClass) -> usize {
        self.class_queue(class).heap.lock().len()
    }

    pub fn is_empty(&self, class: QueueClass) -> bool {
        self.len(class) == 0
    }

    /// Stop accepting work and wake blocked workers.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        for class in QueueClass::ALL {
            let _ = self.class_queue(class).wake_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::queue_priority;

    fn scan_job() -> Job {
        Job::RunScan {
            task_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn jobs_route_to_their_class() {
        assert_eq!(scan_job().class(), QueueClass::Scan);
        assert_eq!(
            Job::ExecuteDag {
                execution_id: Uuid::new_v4()
            }
            .class(),
            QueueClass::Orchestration
        );
        assert_eq!(
            Job::SendNotifications {
                alert_id: Uuid::new_v4(),
                channel_ids: vec![],
            }
            .class(),
            QueueClass::Alerting
        );
    }

    #[tokio::test]
    async fn higher_priority_drains_first() {
        let queue = TaskQueue::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        queue
            .dispatch(Job::RunScan { task_id: low }, queue_priority(2))
            .unwrap();
        queue
            .dispatch(Job::RunScan { task_id: high }, queue_priority(9))
            .unwrap();

        match queue.pull(QueueClass::Scan).await {
            Some(Job::RunScan { task_id }) => assert_eq!(task_id, high),
            other => panic!("unexpected job: {other:?}"),
        }
        match queue.pull(QueueClass::Scan).await {
            Some(Job::RunScan { task_id }) => assert_eq!(task_id, low),
            other => panic!("unexpected job: {other:?}"),
        }
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let queue = TaskQueue::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.dispatch(Job::RunScan { task_id: *id }, 4).unwrap();
        }
        for expected in &ids {
            match queue.pull(QueueClass::Scan).await {
                Some(Job::RunScan { task_id }) => assert_eq!(task_id, *expected),
                other => panic!("unexpected job: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn classes_are_independent() {
        let queue = TaskQueue::new();
        queue.dispatch(scan_job(), 4).unwrap();
        assert_eq!(queue.len(QueueClass::Scan), 1);
        assert!(queue.is_empty(QueueClass::Orchestration));
        assert!(queue.try_pull(QueueClass::Orchestration).is_none());
        assert!(queue.try_pull(QueueClass::Scan).is_some());
    }

    #[tokio::test]
    async fn pull_wakes_on_dispatch() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull(QueueClass::Scan).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.dispatch(scan_job(), 4).unwrap();
        let pulled = puller.await.unwrap();
        assert!(pulled.is_some());
    }

    #[tokio::test]
    async fn close_drains_blocked_workers() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pull(QueueClass::Default).await })
            })
            .collect();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.close();
        for w in workers {
            assert!(w.await.unwrap().is_none());
        }
        assert!(matches!(queue.dispatch(scan_job(), 4), Err(QueueError::Closed)));
    }
}
