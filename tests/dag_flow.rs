//! DAG executor behavior: ready-set advancement, failure skip cascades,
//! cancellation, and termination detection.

mod common;
use common::*;

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use recongraph::dag::{DagExecutor, ExecutionProgress};
use recongraph::queue::{Job, TaskQueue};
use recongraph::store::Store;
use recongraph::store::models::DagExecution;
use recongraph::types::{ExecutionStatus, TaskType, TriggerType};

fn executor(store: &Store) -> (DagExecutor, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::new());
    (DagExecutor::new(store.clone(), queue.clone()), queue)
}

fn node_state(execution: &DagExecution, node: &str) -> String {
    execution.node_states[node]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

async fn refresh(store: &Store, id: Uuid) -> DagExecution {
    store
        .get_dag_execution(id)
        .await
        .expect("get execution")
        .expect("execution exists")
}

#[tokio::test]
async fn linear_chain_advances_node_by_node() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[
            node("a", TaskType::SubdomainScan, &[]),
            node("b", TaskType::DnsResolve, &["a"]),
            node("c", TaskType::PortScan, &["b"]),
        ],
    )
    .await;

    let (executor, queue) = executor(&store);
    let execution = executor
        .create_execution(
            project.id,
            template.id,
            TriggerType::Manual,
            &json!({}),
            &json!({"domain": "example.com"}),
        )
        .await
        .expect("execution");

    // Every node starts pending.
    let created = refresh(&store, execution.id).await;
    for id in ["a", "b", "c"] {
        assert_eq!(node_state(&created, id), "pending");
    }

    executor.start(execution.id).await.expect("start");
    let progress = executor.execute(execution.id).await.expect("iter 1");
    assert_eq!(progress, ExecutionProgress::Dispatched(vec!["a".to_string()]));

    let state = refresh(&store, execution.id).await;
    assert_eq!(node_state(&state, "a"), "running");
    assert_eq!(node_state(&state, "b"), "pending");
    assert_eq!(node_state(&state, "c"), "pending");

    // The dispatched node landed on the scan queue with a task id link.
    let job = queue.try_pull(recongraph::types::QueueClass::Scan).expect("scan job");
    let Job::RunScan { task_id } = job else {
        panic!("unexpected job: {job:?}");
    };
    assert_eq!(
        state.node_task_ids["a"].as_str(),
        Some(task_id.to_string().as_str())
    );

    // A waiting iteration changes nothing.
    assert_eq!(
        executor.execute(execution.id).await.expect("waiting"),
        ExecutionProgress::Waiting
    );

    executor
        .on_node_completed(execution.id, "a", true)
        .await
        .expect("a done");
    let progress = executor.execute(execution.id).await.expect("iter 2");
    assert_eq!(progress, ExecutionProgress::Dispatched(vec!["b".to_string()]));
    let state = refresh(&store, execution.id).await;
    assert_eq!(node_state(&state, "a"), "completed");
    assert_eq!(node_state(&state, "b"), "running");

    executor
        .on_node_completed(execution.id, "b", true)
        .await
        .expect("b done");
    let progress = executor.execute(execution.id).await.expect("iter 3");
    assert_eq!(progress, ExecutionProgress::Dispatched(vec!["c".to_string()]));

    executor
        .on_node_completed(execution.id, "c", true)
        .await
        .expect("c done");
    let progress = executor.execute(execution.id).await.expect("iter 4");
    assert_eq!(progress, ExecutionProgress::Completed);

    let state = refresh(&store, execution.id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    for id in ["a", "b", "c"] {
        assert_eq!(node_state(&state, id), "completed");
    }
    assert!(state.completed_at.is_some());
}

#[tokio::test]
async fn diamond_failure_skips_the_join_and_fails_the_execution() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[
            node("a", TaskType::SubdomainScan, &[]),
            node("b", TaskType::DnsResolve, &["a"]),
            node("c", TaskType::PortScan, &["a"]),
            node("d", TaskType::HttpProbe, &["b", "c"]),
        ],
    )
    .await;

    let (executor, _queue) = executor(&store);
    let execution = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("start");

    executor.execute(execution.id).await.expect("dispatch a");
    executor.on_node_completed(execution.id, "a", true).await.expect("a");

    let progress = executor.execute(execution.id).await.expect("dispatch b c");
    let ExecutionProgress::Dispatched(mut nodes) = progress else {
        panic!("expected dispatch, got {progress:?}");
    };
    nodes.sort();
    assert_eq!(nodes, vec!["b".to_string(), "c".to_string()]);

    executor.on_node_completed(execution.id, "b", true).await.expect("b");
    executor.on_node_completed(execution.id, "c", false).await.expect("c");

    let progress = executor.execute(execution.id).await.expect("final");
    assert_eq!(progress, ExecutionProgress::Failed);

    let state = refresh(&store, execution.id).await;
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(node_state(&state, "b"), "completed");
    assert_eq!(node_state(&state, "c"), "failed");
    assert_eq!(node_state(&state, "d"), "skipped");
}

#[tokio::test]
async fn skip_cascades_through_chains_behind_a_failure() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[
            node("a", TaskType::SubdomainScan, &[]),
            node("b", TaskType::DnsResolve, &["a"]),
            node("c", TaskType::PortScan, &["b"]),
        ],
    )
    .await;

    let (executor, _queue) = executor(&store);
    let execution = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("start");
    executor.execute(execution.id).await.expect("dispatch a");
    executor.on_node_completed(execution.id, "a", false).await.expect("a failed");

    // One iteration settles the whole blocked chain.
    let progress = executor.execute(execution.id).await.expect("cascade");
    assert_eq!(progress, ExecutionProgress::Failed);
    let state = refresh(&store, execution.id).await;
    assert_eq!(node_state(&state, "b"), "skipped");
    assert_eq!(node_state(&state, "c"), "skipped");
    assert_eq!(state.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn empty_template_completes_immediately() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(&store, project.id, &[]).await;

    let (executor, _queue) = executor(&store);
    let execution = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("start");

    assert_eq!(
        executor.execute(execution.id).await.expect("execute"),
        ExecutionProgress::Completed
    );
    let state = refresh(&store, execution.id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn cancelled_execution_halts_dispatch() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[node("a", TaskType::SubdomainScan, &[])],
    )
    .await;

    let (executor, queue) = executor(&store);
    let execution = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("start");
    // Drain the queued iteration job before cancelling.
    let _ = queue.try_pull(recongraph::types::QueueClass::Orchestration);

    executor.cancel(execution.id).await.expect("cancel");
    assert_eq!(
        executor.execute(execution.id).await.expect("halted"),
        ExecutionProgress::Halted
    );
    assert!(queue.try_pull(recongraph::types::QueueClass::Scan).is_none());

    // Terminal status absorbs: cancel is idempotent, restart is refused.
    executor.cancel(execution.id).await.expect("cancel again");
    assert!(executor.start(execution.id).await.is_err());
}

#[tokio::test]
async fn double_start_is_refused() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[node("a", TaskType::SubdomainScan, &[])],
    )
    .await;

    let (executor, _queue) = executor(&store);
    let execution = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("first start");
    assert!(executor.start(execution.id).await.is_err());
}

#[tokio::test]
async fn node_config_overlays_input_config() {
    let store = memory_store().await;
    let project = project(&store).await;
    let mut scan_node = node("a", TaskType::SubdomainScan, &[]);
    scan_node.config = json!({"domain": "override.example.com", "priority": 9});
    let template = template(&store, project.id, &[scan_node]).await;

    let (executor, queue) = executor(&store);
    let execution = executor
        .create_execution(
            project.id,
            template.id,
            TriggerType::Manual,
            &json!({}),
            &json!({"domain": "base.example.com", "batch_size": 10}),
        )
        .await
        .expect("execution");
    executor.start(execution.id).await.expect("start");
    executor.execute(execution.id).await.expect("dispatch");

    let Some(Job::RunScan { task_id }) = queue.try_pull(recongraph::types::QueueClass::Scan)
    else {
        panic!("expected a scan job");
    };
    let task = store.get_scan_task(task_id).await.expect("get").expect("task");
    assert_eq!(task.config["domain"], "override.example.com");
    assert_eq!(task.config["batch_size"], 10);
    assert_eq!(task.priority, 9);
}

#[tokio::test]
async fn cyclic_template_is_rejected_at_create() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[
            node("a", TaskType::SubdomainScan, &["b"]),
            node("b", TaskType::DnsResolve, &["a"]),
        ],
    )
    .await;

    let (executor, _queue) = executor(&store);
    let result = executor
        .create_execution(project.id, template.id, TriggerType::Manual, &json!({}), &json!({}))
        .await;
    assert!(result.is_err());
}
