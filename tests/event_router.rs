//! Event → trigger → DAG execution routing.

mod common;
use common::*;

use std::sync::Arc;

use serde_json::json;

use recongraph::events::EventRouter;
use recongraph::queue::{Job, TaskQueue};
use recongraph::store::Store;
use recongraph::types::{ExecutionStatus, QueueClass, TaskType, TriggerType};

fn router(store: &Store) -> (EventRouter, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::new());
    (EventRouter::new(store.clone(), queue.clone()), queue)
}

#[tokio::test]
async fn matching_event_starts_a_running_execution() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[node("scan", TaskType::SubdomainScan, &[])],
    )
    .await;
    store
        .create_event_trigger(
            project.id,
            "on-asset",
            None,
            "asset_created",
            &json!({"asset_type": "domain"}),
            template.id,
            &json!({"priority": 8}),
            true,
        )
        .await
        .expect("trigger");

    let (router, queue) = router(&store);
    let outcome = router
        .emit(
            project.id,
            "asset_created",
            &json!({"asset_type": "domain", "target": "example.com", "batch_size": 9999}),
        )
        .await
        .expect("emit");

    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.triggered.len(), 1);

    let execution = store
        .get_dag_execution(outcome.triggered[0].execution_id)
        .await
        .expect("get")
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.trigger_type, TriggerType::Event);

    // Whitelisted event keys flow in; everything else is dropped and the
    // trigger's dag_config wins on top.
    assert_eq!(execution.input_config["asset_type"], "domain");
    assert_eq!(execution.input_config["target"], "example.com");
    assert_eq!(execution.input_config["priority"], 8);
    assert!(execution.input_config.get("batch_size").is_none());

    // Audit copy keeps the full payload.
    assert_eq!(execution.trigger_event["event_data"]["batch_size"], 9999);

    // An executor iteration was enqueued.
    assert!(matches!(
        queue.try_pull(QueueClass::Orchestration),
        Some(Job::ExecuteDag { .. })
    ));

    let trigger = store
        .get_event_trigger(outcome.triggered[0].trigger_id)
        .await
        .expect("get trigger")
        .expect("trigger");
    assert_eq!(trigger.trigger_count.total, 1);
    assert_eq!(trigger.trigger_count.success, 1);
}

#[tokio::test]
async fn non_matching_filters_do_not_trigger() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[node("scan", TaskType::SubdomainScan, &[])],
    )
    .await;
    store
        .create_event_trigger(
            project.id,
            "high-sev-only",
            None,
            "vuln_found",
            &json!({"severity": ["high", "critical"]}),
            template.id,
            &json!({}),
            true,
        )
        .await
        .expect("trigger");

    let (router, _queue) = router(&store);

    let outcome = router
        .emit(project.id, "vuln_found", &json!({"severity": "low"}))
        .await
        .expect("emit");
    assert_eq!(outcome.matched, 0);

    // Missing key never matches.
    let outcome = router
        .emit(project.id, "vuln_found", &json!({"target": "x"}))
        .await
        .expect("emit");
    assert_eq!(outcome.matched, 0);

    // Wrong event type never reaches the trigger.
    let outcome = router
        .emit(project.id, "scan_completed", &json!({"severity": "critical"}))
        .await
        .expect("emit");
    assert_eq!(outcome.matched, 0);

    let outcome = router
        .emit(project.id, "vuln_found", &json!({"severity": "critical"}))
        .await
        .expect("emit");
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.triggered.len(), 1);
}

#[tokio::test]
async fn disabled_trigger_or_template_is_skipped() {
    let store = memory_store().await;
    let project = project(&store).await;
    let enabled_template = template(
        &store,
        project.id,
        &[node("scan", TaskType::SubdomainScan, &[])],
    )
    .await;
    let disabled_template = store
        .create_dag_template(
            Some(project.id),
            "disabled",
            None,
            &[node("scan", TaskType::SubdomainScan, &[])],
            false,
            false,
        )
        .await
        .expect("disabled template");

    store
        .create_event_trigger(
            project.id,
            "disabled-trigger",
            None,
            "asset_created",
            &json!({}),
            enabled_template.id,
            &json!({}),
            false,
        )
        .await
        .expect("disabled trigger");
    let broken = store
        .create_event_trigger(
            project.id,
            "broken-template",
            None,
            "asset_created",
            &json!({}),
            disabled_template.id,
            &json!({}),
            true,
        )
        .await
        .expect("broken trigger");

    let (router, _queue) = router(&store);
    let outcome = router
        .emit(project.id, "asset_created", &json!({"asset_type": "domain"}))
        .await
        .expect("emit");

    // Only the enabled trigger matched, and its disabled template made it
    // a failure, not an execution.
    assert_eq!(outcome.matched, 1);
    assert!(outcome.triggered.is_empty());

    let broken = store
        .get_event_trigger(broken.id)
        .await
        .expect("get")
        .expect("trigger");
    assert_eq!(broken.trigger_count.failed, 1);
    assert_eq!(broken.trigger_count.success, 0);
}

#[tokio::test]
async fn duplicate_events_produce_duplicate_executions() {
    let store = memory_store().await;
    let project = project(&store).await;
    let template = template(
        &store,
        project.id,
        &[node("scan", TaskType::SubdomainScan, &[])],
    )
    .await;
    store
        .create_event_trigger(
            project.id,
            "dup",
            None,
            "asset_created",
            &json!({}),
            template.id,
            &json!({}),
            true,
        )
        .await
        .expect("trigger");

    let (router, _queue) = router(&store);
    let data = json!({"asset_type": "domain"});
    let first = router.emit(project.id, "asset_created", &data).await.expect("emit");
    let second = router.emit(project.id, "asset_created", &data).await.expect("emit");
    assert_eq!(first.triggered.len(), 1);
    assert_eq!(second.triggered.len(), 1);
    assert_ne!(
        first.triggered[0].execution_id,
        second.triggered[0].execution_id
    );

    let executions = store
        .list_dag_executions(project.id, None, 10)
        .await
        .expect("list");
    assert_eq!(executions.len(), 2);
}

#[tokio::test]
async fn triggers_are_project_scoped() {
    let store = memory_store().await;
    let project_a = project(&store).await;
    let project_b = project(&store).await;
    let template = template(
        &store,
        project_a.id,
        &[node("scan", TaskType::SubdomainScan, &[])],
    )
    .await;
    store
        .create_event_trigger(
            project_a.id,
            "scoped",
            None,
            "asset_created",
            &json!({}),
            template.id,
            &json!({}),
            true,
        )
        .await
        .expect("trigger");

    let (router, _queue) = router(&store);
    let outcome = router
        .emit(project_b.id, "asset_created", &json!({}))
        .await
        .expect("emit");
    assert_eq!(outcome.matched, 0);
}
