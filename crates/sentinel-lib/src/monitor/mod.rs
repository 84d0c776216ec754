//! Monitor lifecycle types
//!
//! A monitor binds one workload selector to a polling evaluation loop. The
//! supervisor in this module's sibling owns the loops; the types here are
//! the lifecycle state machine and the serializable views of it.

pub mod supervisor;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MetricKind, TimeWindow, WorkloadKey};

pub use supervisor::{HealthSnapshot, MonitorConfig, MonitorSupervisor};

/// Lifecycle state of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl MonitorStatus {
    /// Legal lifecycle moves; everything else is rejected
    ///
    /// Stopped and Errored are terminal, and nothing re-enters Starting.
    /// Starting can move straight to Stopping when a stop request lands
    /// before the loop's first poll.
    pub fn can_transition(self, next: MonitorStatus) -> bool {
        use MonitorStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Errored)
                | (Running, Errored)
                | (Stopping, Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MonitorStatus::Stopped | MonitorStatus::Errored)
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorStatus::Starting => "starting",
            MonitorStatus::Running => "running",
            MonitorStatus::Stopping => "stopping",
            MonitorStatus::Stopped => "stopped",
            MonitorStatus::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

fn default_metrics() -> Vec<MetricKind> {
    vec![MetricKind::CpuUsage, MetricKind::MemoryUsage]
}

fn default_window() -> TimeWindow {
    TimeWindow::Hours1
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// What to watch and how often
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSpec {
    /// Workload this monitor evaluates
    pub selector: WorkloadKey,
    /// Metrics polled each cycle
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricKind>,
    /// Evaluation window fetched per cycle
    #[serde(default = "default_window")]
    pub window: TimeWindow,
    /// Seconds between evaluation cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl MonitorSpec {
    pub fn new(selector: WorkloadKey) -> Self {
        Self {
            selector,
            metrics: default_metrics(),
            window: default_window(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Serializable snapshot of one monitor, as exposed over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorHandle {
    pub id: String,
    pub selector: WorkloadKey,
    pub metrics: Vec<MetricKind>,
    pub window: TimeWindow,
    pub poll_interval_secs: u64,
    pub status: MonitorStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Evaluation cycles completed
    pub evaluations: u64,
    /// Findings raised over the monitor's lifetime
    pub findings: u64,
}
