//! Scan execution: policy-resolved task creation, the per-type handlers,
//! and the worker-side runner.

pub mod dns;
pub mod fingerprint_task;
pub mod http_probe;
pub mod js_discovery;
pub mod js_parser;
pub mod nuclei;
pub mod ports;
pub mod runner;
pub mod screenshot;
pub mod service;
pub mod subdomain;
pub mod tools;
pub mod xray;

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Settings;
use crate::queue::{QueueError, TaskQueue};
use crate::ratelimit::Limiters;
use crate::store::{Store, StoreError};
use crate::types::ScanStatus;

pub use runner::ScanRunner;
pub use service::{CreateScanRequest, ScanService};

#[derive(Debug, Error, Diagnostic)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid scan config: {0}")]
    #[diagnostic(code(recongraph::scans::invalid_config))]
    InvalidConfig(String),

    #[error("rate limit wait timeout for project scan execution")]
    #[diagnostic(code(recongraph::scans::rate_limited))]
    RateLimited,

    #[error("scan task {0} not found")]
    #[diagnostic(code(recongraph::scans::task_not_found))]
    TaskNotFound(Uuid),

    #[error("scan policy {0} not found")]
    #[diagnostic(code(recongraph::scans::policy_not_found))]
    PolicyNotFound(Uuid),

    #[error("scan policy {0} is disabled")]
    #[diagnostic(code(recongraph::scans::policy_disabled))]
    PolicyDisabled(Uuid),

    #[error("task {task}: illegal transition from {from}")]
    #[diagnostic(code(recongraph::scans::precondition))]
    Precondition { task: Uuid, from: ScanStatus },

    #[error("tool {tool} failed: {message}")]
    #[diagnostic(code(recongraph::scans::tool))]
    Tool { tool: String, message: String },
}

/// Everything a scan handler needs: persistence, the broker for
/// follow-on jobs, the limiter pair, and runtime settings.
#[derive(Clone)]
pub struct ScanContext {
    pub store: Store,
    pub queue: Arc<TaskQueue>,
    pub limiters: Arc<Limiters>,
    pub settings: Settings,
}
