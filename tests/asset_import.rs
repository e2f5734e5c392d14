//! Bulk asset import: counters, typed-graph fan-out, and the
//! `asset_created` event.

mod common;
use common::*;

use std::sync::Arc;

use recongraph::assets::import::{ImportAsset, import_assets};
use recongraph::queue::{Job, TaskQueue};
use recongraph::types::QueueClass;

fn asset(asset_type: &str, value: &str) -> ImportAsset {
    ImportAsset {
        asset_type: asset_type.to_string(),
        value: value.to_string(),
        source: None,
    }
}

#[tokio::test]
async fn import_dedups_counts_and_emits_one_event() {
    let store = memory_store().await;
    let project = project(&store).await;
    let queue = Arc::new(TaskQueue::new());

    let outcome = import_assets(
        &store,
        &queue,
        project.id,
        &[
            asset("domain", "sub.example.com"),
            asset("ip", "10.0.0.1"),
            asset("domain", "sub.example.com"),
        ],
    )
    .await
    .expect("import");

    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.total, 3);

    // Typed rows were fanned out.
    let subdomains = store
        .list_subdomains(project.id, None, 10)
        .await
        .expect("subdomains");
    assert_eq!(subdomains.len(), 1);
    assert_eq!(subdomains[0].subdomain, "sub.example.com");
    assert_eq!(subdomains[0].root_domain, "example.com");

    let ips = store.list_ip_addresses(project.id, 10).await.expect("ips");
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].ip, "10.0.0.1");

    // Exactly one asset_created event for the batch.
    let job = queue.try_pull(QueueClass::Orchestration).expect("event job");
    let Job::ProcessEvent {
        project_id,
        event_type,
        event_data,
    } = job
    else {
        panic!("unexpected job: {job:?}");
    };
    assert_eq!(project_id, project.id);
    assert_eq!(event_type, "asset_created");
    assert_eq!(event_data["inserted"], 2);
    assert_eq!(event_data["skipped"], 1);
    assert_eq!(event_data["total"], 3);
    assert_eq!(event_data["domain"], "sub.example.com");
    assert_eq!(event_data["domains"], serde_json::json!(["sub.example.com"]));
    assert_eq!(event_data["ips"], serde_json::json!(["10.0.0.1"]));
    assert!(queue.try_pull(QueueClass::Orchestration).is_none());
}

#[tokio::test]
async fn reimport_emits_no_event() {
    let store = memory_store().await;
    let project = project(&store).await;
    let queue = Arc::new(TaskQueue::new());
    let batch = [asset("domain", "sub.example.com")];

    import_assets(&store, &queue, project.id, &batch)
        .await
        .expect("first import");
    let _ = queue.try_pull(QueueClass::Orchestration);

    let outcome = import_assets(&store, &queue, project.id, &batch)
        .await
        .expect("second import");
    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.skipped, 1);
    assert!(queue.try_pull(QueueClass::Orchestration).is_none());
}

#[tokio::test]
async fn url_imports_become_web_assets_with_default_scheme() {
    let store = memory_store().await;
    let project = project(&store).await;
    let queue = Arc::new(TaskQueue::new());

    import_assets(
        &store,
        &queue,
        project.id,
        &[asset("url", "shop.example.com/cart")],
    )
    .await
    .expect("import");

    let webs = store
        .list_web_assets(project.id, None, 10)
        .await
        .expect("web assets");
    assert_eq!(webs.len(), 1);
    assert_eq!(webs[0].url, "http://shop.example.com/cart");
}

#[tokio::test]
async fn unknown_asset_types_only_land_in_the_ledger() {
    let store = memory_store().await;
    let project = project(&store).await;
    let queue = Arc::new(TaskQueue::new());

    let outcome = import_assets(
        &store,
        &queue,
        project.id,
        &[asset("certificate", "CN=example.com")],
    )
    .await
    .expect("import");
    assert_eq!(outcome.inserted, 1);

    let (total, _) = store
        .list_assets(project.id, Some("certificate"), 0, 10)
        .await
        .expect("ledger");
    assert_eq!(total, 1);
    assert!(store
        .list_subdomains(project.id, None, 10)
        .await
        .expect("subdomains")
        .is_empty());
}
