//! Core types for the recongraph orchestration engine.
//!
//! This module defines the enums shared across the engine: scan task
//! types and statuses, DAG node and execution states, severity levels,
//! and queue routing classes. All of them serialize to the snake_case
//! strings used in persisted rows and event payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a [`ScanTask`](crate::store::models::ScanTask) performs.
///
/// Each variant maps to exactly one handler in [`crate::scans`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SubdomainScan,
    DnsResolve,
    PortScan,
    HttpProbe,
    Fingerprint,
    Screenshot,
    NucleiScan,
    XrayScan,
    JsApiDiscovery,
}

impl TaskType {
    pub const ALL: [TaskType; 9] = [
        TaskType::SubdomainScan,
        TaskType::DnsResolve,
        TaskType::PortScan,
        TaskType::HttpProbe,
        TaskType::Fingerprint,
        TaskType::Screenshot,
        TaskType::NucleiScan,
        TaskType::XrayScan,
        TaskType::JsApiDiscovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SubdomainScan => "subdomain_scan",
            TaskType::DnsResolve => "dns_resolve",
            TaskType::PortScan => "port_scan",
            TaskType::HttpProbe => "http_probe",
            TaskType::Fingerprint => "fingerprint",
            TaskType::Screenshot => "screenshot",
            TaskType::NucleiScan => "nuclei_scan",
            TaskType::XrayScan => "xray_scan",
            TaskType::JsApiDiscovery => "js_api_discovery",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskType> {
        TaskType::ALL.iter().copied().find(|t| t.as_str() == raw)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a scan task.
///
/// Transitions are guarded by the conditional updates in
/// [`Store`](crate::store::Store); see `transition_scan_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<ScanStatus> {
        match raw {
            "pending" => Some(ScanStatus::Pending),
            "running" => Some(ScanStatus::Running),
            "paused" => Some(ScanStatus::Paused),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            "cancelled" => Some(ScanStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states absorb: no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node state within a DAG execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a DAG execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<ExecutionStatus> {
        match raw {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a DAG execution was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Event,
    Schedule,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Event => "event",
            TriggerType::Schedule => "schedule",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked severity used by vulnerabilities, risk scores, and alerting.
///
/// Ordering follows the ranking `critical > high > medium > low > info`:
///
/// ```
/// use recongraph::types::Severity;
///
/// assert!(Severity::Critical > Severity::High);
/// assert_eq!(Severity::parse("medium"), Some(Severity::Medium));
/// assert_eq!(Severity::parse("bogus"), None);
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Severity> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Numeric rank: info=1 .. critical=5. Unknown severities rank 0 at
    /// call sites that deal with free-form strings.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Low => 2,
            Severity::Medium => 3,
            Severity::High => 4,
            Severity::Critical => 5,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing class for the pull queue. Jobs of different families drain
/// through different worker pools so a flood of scans cannot starve
/// orchestration callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Default,
    Scan,
    Orchestration,
    Alerting,
}

impl QueueClass {
    pub const ALL: [QueueClass; 4] = [
        QueueClass::Default,
        QueueClass::Scan,
        QueueClass::Orchestration,
        QueueClass::Alerting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Default => "default",
            QueueClass::Scan => "scan",
            QueueClass::Orchestration => "orchestration",
            QueueClass::Alerting => "alerting",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp an API-level priority (1..=10, default 5) into the internal
/// queue range 0..=9, where higher drains first.
pub fn queue_priority(priority: i64) -> u8 {
    (priority.clamp(1, 10) - 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips() {
        for t in TaskType::ALL {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TaskType::parse("warp_drive"), None);
    }

    #[test]
    fn severity_ordering_matches_rank() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
        assert_eq!(Severity::Critical.rank(), 5);
    }

    #[test]
    fn terminal_scan_states() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(!ScanStatus::Paused.is_terminal());
    }

    #[test]
    fn priority_mapping_clamps() {
        assert_eq!(queue_priority(1), 0);
        assert_eq!(queue_priority(5), 4);
        assert_eq!(queue_priority(10), 9);
        assert_eq!(queue_priority(0), 0);
        assert_eq!(queue_priority(42), 9);
    }
}
