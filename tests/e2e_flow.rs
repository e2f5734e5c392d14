//! End-to-end: asset import emits an event, the event starts a DAG, the
//! worker pool runs the scan (seed-list fallback, no external tools),
//! findings land in the asset graph, and the execution completes.

mod common;
use common::*;

use std::time::Duration;

use serde_json::json;

use recongraph::assets::import::{ImportAsset, import_assets};
use recongraph::types::{ExecutionStatus, TaskType, TriggerType};

#[tokio::test]
async fn import_event_runs_a_dag_to_completion() {
    let (store, _dir) = file_store().await;
    let project = project(&store).await;

    let template = template(
        &store,
        project.id,
        &[node("enumerate", TaskType::SubdomainScan, &[])],
    )
    .await;
    store
        .create_event_trigger(
            project.id,
            "discover-on-import",
            None,
            "asset_created",
            &json!({"source": "assets_import"}),
            template.id,
            &json!({"domain": "example.com"}),
            true,
        )
        .await
        .expect("trigger");

    let engine = engine(store.clone());
    let workers = engine.spawn_default_workers();

    import_assets(
        &store,
        engine.queue(),
        project.id,
        &[ImportAsset {
            asset_type: "domain".to_string(),
            value: "seed.example.com".to_string(),
            source: None,
        }],
    )
    .await
    .expect("import");

    // Wait for the triggered execution to finish.
    let execution = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let executions = store
                .list_dag_executions(project.id, None, 10)
                .await
                .expect("list executions");
            if let Some(done) = executions
                .iter()
                .find(|e| e.status == ExecutionStatus::Completed)
            {
                return done.clone();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("dag execution did not complete in time");

    assert_eq!(execution.trigger_type, TriggerType::Event);
    assert_eq!(execution.node_states["enumerate"], "completed");

    // The scan task the node dispatched completed with a summary.
    let task_id = execution.node_task_ids["enumerate"]
        .as_str()
        .and_then(|raw| uuid::Uuid::parse_str(raw).ok())
        .expect("node task id");
    let task = store
        .get_scan_task(task_id)
        .await
        .expect("get task")
        .expect("task");
    assert_eq!(task.status, recongraph::types::ScanStatus::Completed);
    let summary = task.result_summary.expect("summary");
    assert_eq!(summary["domain"], "example.com");
    assert!(summary["subdomains_found"].as_u64().unwrap_or(0) > 0);

    // Without subfinder on PATH the seed list feeds the graph.
    let subdomains = store
        .list_subdomains(project.id, None, 100)
        .await
        .expect("subdomains");
    let names: Vec<&str> = subdomains.iter().map(|s| s.subdomain.as_str()).collect();
    assert!(names.contains(&"seed.example.com"));
    assert!(names.contains(&"www.example.com"));

    engine.shutdown();
    for worker in workers {
        worker.await.expect("worker join");
    }
}

#[tokio::test]
async fn manual_scan_through_the_worker_pool() {
    let (store, _dir) = file_store().await;
    let project = project(&store).await;
    let engine = engine(store.clone());
    let workers = engine.spawn_default_workers();

    let mut request = recongraph::scans::CreateScanRequest::new(TaskType::SubdomainScan);
    request.config = json!({"domain": "example.org"});
    let task = engine
        .scans()
        .create_scan(project.id, request)
        .await
        .expect("create");
    engine.scans().start(task.id).await.expect("start");

    let finished = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let current = store
                .get_scan_task(task.id)
                .await
                .expect("get")
                .expect("task");
            if current.status.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("scan did not finish in time");

    assert_eq!(finished.status, recongraph::types::ScanStatus::Completed);
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());

    engine.shutdown();
    for worker in workers {
        worker.await.expect("worker join");
    }
}
