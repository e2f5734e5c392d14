//! Persistence layer.
//!
//! `Store` wraps a sqlite pool and exposes the engine's operations as
//! async methods: upsert-by-fingerprint for the asset graph, conditional
//! status transitions for scan tasks and DAG executions, and the alert /
//! risk bookkeeping. Queries use runtime `sqlx::query` with explicit row
//! decoding; JSON aggregates live in TEXT columns and are (de)serialized
//! at this boundary.
//!
//! ## Row locking
//!
//! JSON aggregate fields (`node_states`, `node_task_ids`,
//! `trigger_count`, `notification_results`) are read-modify-write. The
//! engine runs as a single orchestrator process, so those updates
//! serialize through a per-row async mutex registry rather than
//! SELECT-FOR-UPDATE; conditional `UPDATE ... WHERE id = ? AND status = ?`
//! remains the serialization point for state machines.

pub mod alerts;
pub mod assets;
pub mod dag;
pub mod models;
pub mod projects;
pub mod risk;
pub mod scans;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[diagnostic(
        code(recongraph::store::sqlx),
        help("Ensure the database URL is valid and migrations have been applied.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    #[diagnostic(code(recongraph::store::migrate))]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {reason}")]
    #[diagnostic(code(recongraph::store::corrupt))]
    Corrupt { reason: String },

    #[error("{what} not found")]
    #[diagnostic(code(recongraph::store::not_found))]
    NotFound { what: String },

    #[error("conflict: {reason}")]
    #[diagnostic(code(recongraph::store::conflict))]
    Conflict { reason: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// The engine's persistence handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    row_locks: Arc<Mutex<FxHashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Store {
    /// Connect to `database_url` and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests; the single pooled connection keeps
    /// every caller on the same database.
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Store {
            pool,
            row_locks: Arc::new(Mutex::new(FxHashMap::default())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Per-row async mutex used for JSON aggregate read-modify-writes.
    pub(crate) fn row_lock(&self, row_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock();
        locks
            .entry(row_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Decode helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Corrupt {
        reason: format!("{what}: invalid uuid {raw:?}"),
    })
}

pub(crate) fn opt_uuid(raw: Option<String>, what: &str) -> Result<Option<Uuid>> {
    match raw {
        Some(s) => parse_uuid(&s, what).map(Some),
        None => Ok(None),
    }
}

/// JSON TEXT column → `serde_json::Value`; NULL decodes as the default.
pub(crate) fn parse_json(raw: Option<String>, default: serde_json::Value) -> serde_json::Value {
    match raw {
        Some(text) => serde_json::from_str(&text).unwrap_or(default),
        None => default,
    }
}

/// `serde_json::Value` → TEXT. Value serialization cannot fail for the
/// shapes we store; fall back to `null` rather than poisoning a write.
pub(crate) fn json_text(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

pub(crate) fn string_vec_json(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn parse_string_vec(raw: Option<String>) -> Vec<String> {
    raw.and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
        .unwrap_or_default()
}

pub(crate) fn parse_severity(raw: &str) -> crate::types::Severity {
    crate::types::Severity::parse(raw).unwrap_or(crate::types::Severity::Info)
}
