//! Fingerprint rule loading and the process-wide engine cache.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use super::engine::FingerprintEngine;

/// Load rules from a JSON file (an array of rule objects). A missing or
/// unreadable file yields an empty rule set; fingerprinting degrades,
/// scans do not fail.
pub fn load_rules(path: &str) -> Vec<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path, error = %e, "fingerprint database not readable");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<Value>>(&content) {
        Ok(rules) => {
            info!(path, count = rules.len(), "loaded fingerprint rules");
            rules
        }
        Err(e) => {
            warn!(path, error = %e, "fingerprint database is not a JSON array");
            Vec::new()
        }
    }
}

static ENGINE: RwLock<Option<(String, Arc<FingerprintEngine>)>> = RwLock::new(None);

/// The cached engine for `path`; compiled lazily on first use and
/// recompiled when the path changes.
pub fn global(path: &str) -> Arc<FingerprintEngine> {
    if let Some((cached_path, engine)) = ENGINE.read().as_ref() {
        if cached_path == path {
            return engine.clone();
        }
    }
    let mut slot = ENGINE.write();
    // A racing caller may have filled the slot for the same path.
    if let Some((cached_path, engine)) = slot.as_ref() {
        if cached_path == path {
            return engine.clone();
        }
    }
    let engine = Arc::new(FingerprintEngine::from_values(load_rules(path)));
    *slot = Some((path.to_string(), engine.clone()));
    engine
}

/// Drop the cached engine. Tests use this between cases.
pub fn reset_global() {
    *ENGINE.write() = None;
}
