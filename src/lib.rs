//! # Recongraph: EASM Scan-Orchestration Engine
//!
//! Recongraph is the core engine of an external attack surface
//! management platform: it accepts asset-discovery and vulnerability
//! scan jobs, composes them into DAG workflows, schedules them against
//! worker pools under per-project rate limits, folds tool output into a
//! deduplicated asset graph, reacts to observation events by starting
//! downstream DAGs, and feeds a risk-scoring and alerting pipeline with
//! cooldown and aggregation discipline.
//!
//! ## Architecture
//!
//! ```text
//! REST adapter (external)
//!     │ create ScanTask / DAGExecution
//!     ▼
//! DagExecutor ──▶ TaskQueue (priority, routed by class)
//!                     │ pull
//!                     ▼
//!              worker pools (Engine)
//!                     │
//!              ScanRunner ── rate limit gate ── tool subprocess
//!                     │ upsert observations
//!                     ▼
//!                  Store (asset graph)
//!                     │ events
//!                     ▼
//!              EventRouter ──▶ new DAG executions
//!                     │
//!        RiskCalculator ──▶ Alerter ──▶ Notifier (SSRF-guarded)
//! ```
//!
//! The persistence boundary is [`store::Store`]; every component service
//! hangs off [`engine::Engine`], which owns the queue and worker pools.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use recongraph::config::Settings;
//! use recongraph::engine::Engine;
//! use recongraph::store::Store;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_env();
//! settings.validate_runtime()?;
//!
//! let store = Store::connect(&settings.database_url).await?;
//! let engine = Engine::new(store, settings);
//! let workers = engine.spawn_default_workers();
//!
//! // The REST adapter now calls engine.scans(), engine.dag(),
//! // engine.events(), ... to drive the pipeline.
//! # let _ = workers;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod assets;
pub mod config;
pub mod dag;
pub mod engine;
pub mod events;
pub mod fingerprints;
pub mod queue;
pub mod ratelimit;
pub mod risk;
pub mod scans;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod util;
pub mod vuln;

pub use engine::Engine;
