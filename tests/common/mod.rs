#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use recongraph::config::Settings;
use recongraph::engine::Engine;
use recongraph::store::Store;
use recongraph::store::models::{DagNode, DagTemplate, Project};
use recongraph::types::TaskType;

/// Fresh in-memory store with migrations applied.
pub async fn memory_store() -> Store {
    Store::connect_memory().await.expect("in-memory store")
}

/// File-backed store for tests that lean on pool concurrency. Keep the
/// TempDir alive for the duration of the test.
pub async fn file_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("recongraph-test.db");
    let store = Store::connect(&format!("sqlite://{}", path.display()))
        .await
        .expect("file store");
    (store, dir)
}

pub async fn project(store: &Store) -> Project {
    project_with_rate_limit(store, 10).await
}

pub async fn project_with_rate_limit(store: &Store, max_rps: u64) -> Project {
    store
        .create_project(
            &format!("proj-{}", Uuid::new_v4()),
            Some("test project"),
            &json!({
                "max_requests_per_second": max_rps,
                "max_concurrent_scans": 5,
            }),
        )
        .await
        .expect("project")
}

pub fn node(id: &str, task_type: TaskType, deps: &[&str]) -> DagNode {
    DagNode {
        id: id.to_string(),
        task_type,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        config: json!({}),
    }
}

pub async fn template(store: &Store, project_id: Uuid, nodes: &[DagNode]) -> DagTemplate {
    store
        .create_dag_template(
            Some(project_id),
            &format!("tmpl-{}", Uuid::new_v4()),
            None,
            nodes,
            false,
            true,
        )
        .await
        .expect("template")
}

pub fn engine(store: Store) -> Arc<Engine> {
    let mut settings = Settings::default();
    settings.auth_enabled = false;
    Engine::new(store, settings)
}
