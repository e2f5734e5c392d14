//! Rate limiter behavior under concurrency.

mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use recongraph::ratelimit::{InMemoryWindowStore, Limiters, WindowStore};

#[tokio::test]
async fn project_rate_limit_admits_at_most_the_configured_burst() {
    let limiters = Arc::new(Limiters::new(Arc::new(InMemoryWindowStore::new())));
    let project_id = uuid::Uuid::new_v4();
    let config = json!({"max_requests_per_second": 2});

    // Five concurrent waiters with a 500 ms cap against a 1 s window:
    // exactly two get in, the rest time out before the window frees.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiters = limiters.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            limiters
                .wait_for_project_rate_limit(
                    project_id,
                    &config,
                    None,
                    Duration::from_millis(500),
                )
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.expect("join") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2);
}

#[tokio::test]
async fn admissions_never_exceed_max_within_any_window() {
    let store = Arc::new(InMemoryWindowStore::new());
    let window = Duration::from_millis(200);

    let mut admitted = 0u32;
    for _ in 0..50 {
        if store.admit("prop", 3, window).await.expect("admit") {
            admitted += 1;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // 50 attempts over ~500 ms against 3-per-200 ms can admit at most
    // ceil(duration/window + 1) * max; the loose bound catches breakage.
    assert!(admitted <= 3 * 4, "admitted {admitted}");
    assert!(admitted >= 3);
}

#[tokio::test]
async fn task_override_tightens_the_project_budget() {
    let limiters = Limiters::new(Arc::new(InMemoryWindowStore::new()));
    let project_id = uuid::Uuid::new_v4();
    let project_config = json!({"max_requests_per_second": 10});
    let task_config = json!({"rate_limit_config": {"max_requests_per_second": 1}});

    let first = limiters
        .wait_for_project_rate_limit(
            project_id,
            &project_config,
            Some(&task_config),
            Duration::from_millis(100),
        )
        .await;
    let second = limiters
        .wait_for_project_rate_limit(
            project_id,
            &project_config,
            Some(&task_config),
            Duration::from_millis(100),
        )
        .await;

    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn global_singleton_resets_cleanly() {
    recongraph::ratelimit::reset_global();
    let limiters = recongraph::ratelimit::global();
    assert!(
        limiters
            .scan
            .is_allowed("reset-check", 1, Duration::from_secs(60))
            .await
    );
    assert!(
        !limiters
            .scan
            .is_allowed("reset-check", 1, Duration::from_secs(60))
            .await
    );

    recongraph::ratelimit::reset_global();
    let fresh = recongraph::ratelimit::global();
    assert!(
        fresh
            .scan
            .is_allowed("reset-check", 1, Duration::from_secs(60))
            .await
    );
}
