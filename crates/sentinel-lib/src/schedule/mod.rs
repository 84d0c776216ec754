//! Scheduled automation types
//!
//! A schedule binds a cron expression to a named kind of engine run. The
//! runner in this module's sibling evaluates due schedules; the types here
//! are the records it manages and the contract it executes through.

pub mod runner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::generate_id;

pub use runner::{ScheduleConfig, ScheduleRunner};

/// What a scheduled run does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Evaluate a set of workloads against the detection rules
    Analysis,
    /// Warm metric queries so evaluation windows are populated
    Collection,
    /// Summarize current findings into a health report
    Report,
    /// Prune aged records from the store
    Cleanup,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunKind::Analysis => "analysis",
            RunKind::Collection => "collection",
            RunKind::Report => "report",
            RunKind::Cleanup => "cleanup",
        };
        write!(f, "{s}")
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Manual,
}

/// Terminal result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
    /// The schedule was disabled when the trigger arrived
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Skipped => "skipped",
        }
    }
}

/// A recurring engine task driven by a cron expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Five-field cron expression, evaluated in UTC
    pub cron: String,
    pub run_kind: RunKind,
    /// Opaque parameters handed to the run handler
    #[serde(default)]
    pub params: serde_json::Value,
    /// Disabled schedules keep their config but never become due
    pub enabled: bool,
    /// Set automatically after repeated failures; cleared by resume
    pub paused: bool,
    pub consecutive_failures: u32,
    pub run_count: u64,
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next cron occurrence; `None` while disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cron: impl Into<String>, run_kind: RunKind) -> Self {
        Self {
            id: generate_id("sch"),
            name: name.into(),
            description: None,
            cron: cron.into(),
            run_kind,
            params: serde_json::Value::Null,
            enabled: true,
            paused: false,
            consecutive_failures: 0,
            run_count: 0,
            failure_count: 0,
            last_run_at: None,
            next_due: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Whether the runner should fire this schedule at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.paused && self.next_due.map(|due| due <= now).unwrap_or(false)
    }
}

/// Immutable record of one completed (or skipped) run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: String,
    pub schedule_id: String,
    pub run_kind: RunKind,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Handler-provided summary on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScheduleRun {
    pub fn duration_seconds(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// Executes the work behind a scheduled run
///
/// `Ok` carries a human-readable summary; `Err` marks the run failed and
/// counts toward the schedule's failure streak.
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn execute(&self, kind: RunKind, params: &serde_json::Value) -> anyhow::Result<String>;
}
