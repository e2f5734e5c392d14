//! Asset graph store behavior: upsert semantics, duplicate merging, and
//! the project cascade delete.

mod common;
use common::*;

use serde_json::json;
use uuid::Uuid;

use recongraph::store::assets::{VulnerabilityInput, WebAssetPatch};
use recongraph::types::Severity;

#[tokio::test]
async fn subdomain_upsert_is_idempotent_and_keeps_first_seen() {
    let store = memory_store().await;
    let project = project(&store).await;

    let first = store
        .upsert_subdomain(project.id, "example.com", "www.example.com", "subfinder", None, None)
        .await
        .expect("first upsert");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let second = store
        .upsert_subdomain(
            project.id,
            "example.com",
            "www.example.com",
            "subfinder",
            Some(&["10.0.0.1".to_string()]),
            Some("edge.example.net"),
        )
        .await
        .expect("second upsert");

    assert_eq!(first.id, second.id);
    assert_eq!(second.first_seen, first.first_seen);
    assert!(second.last_seen >= first.last_seen);
    assert_eq!(second.ip_addresses, vec!["10.0.0.1".to_string()]);
    assert_eq!(second.cname.as_deref(), Some("edge.example.net"));

    // A later upsert without the optional fields never clears them.
    let third = store
        .upsert_subdomain(project.id, "example.com", "www.example.com", "subfinder", None, None)
        .await
        .expect("third upsert");
    assert_eq!(third.ip_addresses, vec!["10.0.0.1".to_string()]);
    assert_eq!(third.cname.as_deref(), Some("edge.example.net"));
}

#[tokio::test]
async fn fingerprints_do_not_collide_across_projects() {
    let store = memory_store().await;
    let p1 = project(&store).await;
    let p2 = project(&store).await;

    let a = store
        .upsert_subdomain(p1.id, "example.com", "www.example.com", "subfinder", None, None)
        .await
        .expect("p1 subdomain");
    let b = store
        .upsert_subdomain(p2.id, "example.com", "www.example.com", "subfinder", None, None)
        .await
        .expect("p2 subdomain");

    assert_ne!(a.fingerprint_hash, b.fingerprint_hash);
}

#[tokio::test]
async fn web_asset_normalized_url_is_the_natural_key() {
    let store = memory_store().await;
    let project = project(&store).await;

    let a = store
        .upsert_web_asset(project.id, "http://Example.com:80/login/", WebAssetPatch::default())
        .await
        .expect("first");
    let b = store
        .upsert_web_asset(
            project.id,
            "http://example.com/login",
            WebAssetPatch {
                title: Some("Login".to_string()),
                is_alive: Some(true),
                ..WebAssetPatch::default()
            },
        )
        .await
        .expect("second");

    assert_eq!(a.id, b.id);
    assert_eq!(b.normalized_url, "http://example.com/login");
    assert_eq!(b.title.as_deref(), Some("Login"));
    assert!(b.is_alive);
}

#[tokio::test]
async fn port_natural_key_is_ip_port_protocol() {
    let store = memory_store().await;
    let project = project(&store).await;
    let ip = store
        .upsert_ip_address(project.id, "10.0.0.1", "dns_resolve")
        .await
        .expect("ip");

    let first = store
        .upsert_port(ip.id, 443, "tcp", "open", Some("https"), None)
        .await
        .expect("port");
    let second = store
        .upsert_port(ip.id, 443, "tcp", "open", None, Some("TLSv1.3"))
        .await
        .expect("port again");

    assert_eq!(first.id, second.id);
    // Merge keeps the known service and adds the banner.
    assert_eq!(second.service.as_deref(), Some("https"));
    assert_eq!(second.banner.as_deref(), Some("TLSv1.3"));

    let udp = store
        .upsert_port(ip.id, 443, "udp", "open", None, None)
        .await
        .expect("udp port");
    assert_ne!(udp.id, first.id);
}

#[tokio::test]
async fn duplicate_subdomains_merge_keeping_newest_and_unioning_ips() {
    let store = memory_store().await;
    let project = project(&store).await;

    // Two rows sharing a fingerprint can only exist via direct writes
    // (e.g. imported from an older database); simulate that.
    let keeper = store
        .upsert_subdomain(
            project.id,
            "example.com",
            "dup.example.com",
            "subfinder",
            Some(&["10.0.0.1".to_string()]),
            None,
        )
        .await
        .expect("keeper");

    sqlx::query(
        "INSERT INTO subdomains
            (id, project_id, root_domain, subdomain, source, ip_addresses,
             fingerprint_hash, first_seen, last_seen)
         VALUES (?, ?, 'example.com', 'dup-old.example.com', 'import', ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project.id.to_string())
    .bind(json!(["10.0.0.2"]).to_string())
    .bind(keeper.fingerprint_hash.clone())
    .bind(keeper.first_seen - chrono::Duration::hours(2))
    .bind(keeper.last_seen - chrono::Duration::hours(1))
    .execute(store.pool())
    .await
    .expect("legacy row");

    let merged = store
        .merge_duplicate_subdomains(project.id)
        .await
        .expect("merge");
    assert_eq!(merged, 1);

    let survivors = store
        .list_subdomains(project.id, None, 100)
        .await
        .expect("list");
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, keeper.id);
    let mut ips = survivors[0].ip_addresses.clone();
    ips.sort();
    assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
}

#[tokio::test]
async fn bulk_import_counts_inserted_and_skipped() {
    let store = memory_store().await;
    let project = project(&store).await;

    let batch = vec![
        ("domain".to_string(), "sub.example.com".to_string(), None),
        ("ip".to_string(), "10.0.0.1".to_string(), None),
        ("domain".to_string(), "sub.example.com".to_string(), None),
    ];
    let (inserted, skipped, total) = store
        .bulk_import_assets(project.id, &batch)
        .await
        .expect("import");
    assert_eq!((inserted, skipped, total), (2, 1, 3));

    // Re-importing the same batch inserts nothing.
    let (inserted, skipped, total) = store
        .bulk_import_assets(project.id, &batch)
        .await
        .expect("re-import");
    assert_eq!((inserted, skipped, total), (0, 3, 3));
}

#[tokio::test]
async fn project_name_conflicts_are_reported() {
    let store = memory_store().await;
    let project = project(&store).await;
    let result = store.create_project(&project.name, None, &json!({})).await;
    assert!(matches!(
        result,
        Err(recongraph::store::StoreError::Conflict { .. })
    ));
}

#[tokio::test]
async fn cascade_delete_removes_the_whole_project() {
    let store = memory_store().await;
    let project = project(&store).await;

    let subdomain = store
        .upsert_subdomain(project.id, "example.com", "www.example.com", "subfinder", None, None)
        .await
        .expect("subdomain");
    let ip = store
        .upsert_ip_address(project.id, "10.0.0.1", "dns_resolve")
        .await
        .expect("ip");
    store
        .upsert_port(ip.id, 443, "tcp", "open", None, None)
        .await
        .expect("port");
    let web = store
        .upsert_web_asset(project.id, "https://www.example.com/", WebAssetPatch::default())
        .await
        .expect("web asset");
    let js = store
        .upsert_js_asset(
            project.id,
            Some(web.id),
            "https://www.example.com/app.js",
            "external",
            "cafebabe",
            None,
            &json!({}),
        )
        .await
        .expect("js asset");
    let endpoint = store
        .upsert_api_endpoint(
            project.id,
            Some(js.id),
            "/api/users",
            "GET",
            None,
            &json!({}),
        )
        .await
        .expect("endpoint");
    store
        .upsert_api_risk_finding(
            project.id,
            Some(endpoint.id),
            "graphql_surface",
            Severity::Low,
            None,
            None,
            &json!({}),
        )
        .await
        .expect("api risk");
    store
        .upsert_vulnerability(
            project.id,
            VulnerabilityInput {
                target_url: "https://www.example.com/".to_string(),
                template_id: "tech-detect".to_string(),
                severity: Severity::Medium,
                ..VulnerabilityInput::default()
            },
        )
        .await
        .expect("vuln");

    assert!(store.delete_project(project.id).await.expect("delete"));
    assert!(store.get_project(project.id).await.expect("get").is_none());

    // Every project-scoped table is empty again.
    for table in [
        "subdomains",
        "ip_addresses",
        "web_assets",
        "js_assets",
        "api_endpoints",
        "api_risk_findings",
        "vulnerabilities",
        "asset_entities",
    ] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 0, "table {table} not empty");
    }
    let ports: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ports")
        .fetch_one(store.pool())
        .await
        .expect("ports count");
    assert_eq!(ports, 0);

    let _ = subdomain;
    assert!(!store.delete_project(project.id).await.expect("second delete"));
}
