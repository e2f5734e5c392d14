//! Per-project sliding-window rate limiting.
//!
//! Admissions for a key are constrained by the count of timestamps that
//! fall within the most recent `window`. The window set lives behind the
//! [`WindowStore`] seam so the engine can plug in a shared backend; the
//! in-process store is the default and runs the same atomic pipeline the
//! shared one would: prune expired entries, count, then conditionally
//! record the admission.
//!
//! Two key spaces exist on purpose. Scan-execution gates use the `scan:`
//! prefix, generic callers get `ratelimit:`; the two never interfere.
//!
//! On a backend error the limiter chooses availability over strict
//! compliance: it logs and admits.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Key prefix for scan-execution admission.
pub const SCAN_PREFIX: &str = "scan";
/// Key prefix for generic job-level admission.
pub const GENERIC_PREFIX: &str = "ratelimit";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default cap for [`RateLimiter::wait_if_needed`].
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Diagnostic)]
pub enum WindowStoreError {
    #[error("rate limit backend unavailable: {0}")]
    #[diagnostic(code(recongraph::ratelimit::backend))]
    Backend(String),
}

/// Storage seam for the sliding window sets.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Run the admission pipeline for `key`: prune entries older than
    /// `window`, count the survivors, and if the count is below
    /// `max_requests` record the admission and return `true`.
    async fn admit(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<bool, WindowStoreError>;

    /// Remaining admissions in the current window (floor 0).
    async fn remaining(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<u32, WindowStoreError>;

    /// Drop every window set. Used by tests and singleton reset.
    fn clear(&self);
}

/// In-process window store: one timestamp vector per key.
#[derive(Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<FxHashMap<String, Vec<Instant>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn admit(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<bool, WindowStoreError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        if entries.len() >= max_requests as usize {
            return Ok(false);
        }
        entries.push(now);
        Ok(true)
    }

    async fn remaining(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<u32, WindowStoreError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        Ok(max_requests.saturating_sub(entries.len() as u32))
    }

    fn clear(&self) {
        self.windows.lock().clear();
    }
}

/// Effective rate-limit knobs for a project, after task overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_second: u32,
    pub max_concurrent_scans: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests_per_second: 10,
            max_concurrent_scans: 5,
        }
    }
}

fn read_u32(value: Option<&serde_json::Value>) -> Option<u32> {
    value.and_then(|v| v.as_u64()).map(|v| v.min(u32::MAX as u64) as u32)
}

/// Merge the project-level `rate_limit_config` with the task-level
/// override (`config.rate_limit_config`); the task wins per key.
pub fn effective_rate_limit(
    project_config: &serde_json::Value,
    task_config: Option<&serde_json::Value>,
) -> RateLimitConfig {
    let mut merged = RateLimitConfig::default();
    let task_override = task_config.and_then(|c| c.get("rate_limit_config"));

    for source in [Some(project_config), task_override].into_iter().flatten() {
        if let Some(v) = read_u32(source.get("max_requests_per_second")) {
            merged.max_requests_per_second = v.max(1);
        }
        if let Some(v) = read_u32(source.get("max_concurrent_scans")) {
            merged.max_concurrent_scans = v.max(1);
        }
    }
    merged
}

/// Sliding-window limiter over a [`WindowStore`], scoped by key prefix.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    key_prefix: &'static str,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, key_prefix: &'static str) -> Self {
        RateLimiter { store, key_prefix }
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    /// Check and record an admission. Fails open on backend errors.
    pub async fn is_allowed(&self, identifier: &str, max_requests: u32, window: Duration) -> bool {
        match self.store.admit(&self.key(identifier), max_requests, window).await {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(identifier, %err, "rate limit backend error, admitting");
                true
            }
        }
    }

    /// Poll [`Self::is_allowed`] every 100 ms until admitted or until
    /// `max_wait` elapses. Returns `false` on timeout.
    pub async fn wait_if_needed(
        &self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
        max_wait: Duration,
    ) -> bool {
        let start = Instant::now();
        loop {
            if self.is_allowed(identifier, max_requests, window).await {
                return true;
            }
            if start.elapsed() >= max_wait {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(max_wait.saturating_sub(start.elapsed()))).await;
        }
    }

    /// Remaining admissions in the current window. Fails open to `max`.
    pub async fn remaining(&self, identifier: &str, max_requests: u32, window: Duration) -> u32 {
        match self
            .store
            .remaining(&self.key(identifier), max_requests, window)
            .await
        {
            Ok(left) => left,
            Err(err) => {
                warn!(identifier, %err, "rate limit backend error, reporting full window");
                max_requests
            }
        }
    }
}

/// The process-wide limiter pair: one store, two key spaces.
pub struct Limiters {
    pub scan: RateLimiter,
    pub generic: RateLimiter,
    store: Arc<dyn WindowStore>,
}

impl Limiters {
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Limiters {
            scan: RateLimiter::new(store.clone(), SCAN_PREFIX),
            generic: RateLimiter::new(store.clone(), GENERIC_PREFIX),
            store,
        }
    }

    /// Gate a scan execution for `project_id` under the effective
    /// per-second budget, waiting up to `max_wait`.
    pub async fn wait_for_project_rate_limit(
        &self,
        project_id: Uuid,
        project_config: &serde_json::Value,
        task_config: Option<&serde_json::Value>,
        max_wait: Duration,
    ) -> bool {
        let config = effective_rate_limit(project_config, task_config);
        self.scan
            .wait_if_needed(
                &project_id.to_string(),
                config.max_requests_per_second,
                Duration::from_secs(1),
                max_wait,
            )
            .await
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

static GLOBAL: RwLock<Option<Arc<Limiters>>> = RwLock::new(None);

/// Lazily initialized process-wide limiter pair.
pub fn global() -> Arc<Limiters> {
    if let Some(existing) = GLOBAL.read().as_ref() {
        return existing.clone();
    }
    let mut slot = GLOBAL.write();
    slot.get_or_insert_with(|| Arc::new(Limiters::new(Arc::new(InMemoryWindowStore::new()))))
        .clone()
}

/// Drop the global limiter state. Tests use this between cases.
pub fn reset_global() {
    *GLOBAL.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryWindowStore::new()), SCAN_PREFIX)
    }

    #[tokio::test]
    async fn window_caps_admissions() {
        let l = limiter();
        let window = Duration::from_secs(5);
        assert!(l.is_allowed("p1", 2, window).await);
        assert!(l.is_allowed("p1", 2, window).await);
        assert!(!l.is_allowed("p1", 2, window).await);
        // A different key has its own window.
        assert!(l.is_allowed("p2", 2, window).await);
    }

    #[tokio::test]
    async fn window_expires() {
        let l = limiter();
        let window = Duration::from_millis(80);
        assert!(l.is_allowed("p1", 1, window).await);
        assert!(!l.is_allowed("p1", 1, window).await);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(l.is_allowed("p1", 1, window).await);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let l = limiter();
        let window = Duration::from_secs(5);
        assert!(l.is_allowed("p1", 1, window).await);
        let admitted = l
            .wait_if_needed("p1", 1, window, Duration::from_millis(250))
            .await;
        assert!(!admitted);
    }

    #[tokio::test]
    async fn wait_succeeds_when_window_frees() {
        let l = limiter();
        let window = Duration::from_millis(150);
        assert!(l.is_allowed("p1", 1, window).await);
        let admitted = l
            .wait_if_needed("p1", 1, window, Duration::from_secs(2))
            .await;
        assert!(admitted);
    }

    #[tokio::test]
    async fn scan_and_generic_keys_are_disjoint() {
        let store: Arc<dyn WindowStore> = Arc::new(InMemoryWindowStore::new());
        let limiters = Limiters::new(store);
        let window = Duration::from_secs(5);
        assert!(limiters.scan.is_allowed("x", 1, window).await);
        // Exhausting the scan window leaves the generic space untouched.
        assert!(!limiters.scan.is_allowed("x", 1, window).await);
        assert!(limiters.generic.is_allowed("x", 1, window).await);
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let l = limiter();
        let window = Duration::from_secs(5);
        assert_eq!(l.remaining("p1", 3, window).await, 3);
        assert!(l.is_allowed("p1", 3, window).await);
        assert_eq!(l.remaining("p1", 3, window).await, 2);
    }

    #[test]
    fn effective_config_merges_with_task_override() {
        let project = json!({"max_requests_per_second": 4});
        let task = json!({"rate_limit_config": {"max_requests_per_second": 2}});

        let merged = effective_rate_limit(&project, Some(&task));
        assert_eq!(merged.max_requests_per_second, 2);
        assert_eq!(merged.max_concurrent_scans, 5);

        let merged = effective_rate_limit(&project, None);
        assert_eq!(merged.max_requests_per_second, 4);
    }

    #[test]
    fn effective_config_floors_at_one() {
        let project = json!({"max_requests_per_second": 0});
        let merged = effective_rate_limit(&project, None);
        // Zero would deadlock every scan; the knob floors at 1.
        assert_eq!(merged.max_requests_per_second, 1);
    }
}
