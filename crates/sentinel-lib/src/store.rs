//! Persistence seam for engine records
//!
//! The engine writes monitor snapshots, delivery attempts, schedules, and
//! run history through [`RecordStore`]. The in-memory implementation is the
//! default deployment; anything durable can slot in behind the same trait.

use std::collections::VecDeque;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::monitor::MonitorHandle;
use crate::notify::DeliveryAttempt;
use crate::schedule::{Schedule, ScheduleRun};

/// Delivery attempts retained before the oldest are dropped
const DELIVERY_LOG_CAP: usize = 5000;

/// Run records retained per schedule
const RUNS_PER_SCHEDULE: usize = 50;

/// Storage contract for everything the engine wants to survive a request
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_monitor(&self, handle: MonitorHandle) -> Result<()>;
    async fn get_monitor(&self, id: &str) -> Result<Option<MonitorHandle>>;
    async fn list_monitors(&self) -> Result<Vec<MonitorHandle>>;
    async fn delete_monitor(&self, id: &str) -> Result<()>;

    /// Insert or update an attempt; the key is (alert, webhook, attempt)
    async fn record_delivery(&self, attempt: DeliveryAttempt) -> Result<()>;
    /// Full attempt trail for one alert, oldest first
    async fn delivery_log(&self, alert_id: &str) -> Result<Vec<DeliveryAttempt>>;

    async fn put_schedule(&self, schedule: Schedule) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;

    /// Insert or update a run record by its id
    async fn record_run(&self, run: ScheduleRun) -> Result<()>;
    /// Most recent runs for a schedule, newest first
    async fn runs_for(&self, schedule_id: &str, limit: usize) -> Result<Vec<ScheduleRun>>;

    /// Drop deliveries and runs finished before the cutoff; returns how many
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Default store; everything lives in process memory with bounded logs
pub struct MemoryStore {
    monitors: DashMap<String, MonitorHandle>,
    deliveries: RwLock<VecDeque<DeliveryAttempt>>,
    schedules: DashMap<String, Schedule>,
    runs: RwLock<VecDeque<ScheduleRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            monitors: DashMap::new(),
            deliveries: RwLock::new(VecDeque::new()),
            schedules: DashMap::new(),
            runs: RwLock::new(VecDeque::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_monitor(&self, handle: MonitorHandle) -> Result<()> {
        self.monitors.insert(handle.id.clone(), handle);
        Ok(())
    }

    async fn get_monitor(&self, id: &str) -> Result<Option<MonitorHandle>> {
        Ok(self.monitors.get(id).map(|entry| entry.clone()))
    }

    async fn list_monitors(&self) -> Result<Vec<MonitorHandle>> {
        let mut handles: Vec<MonitorHandle> =
            self.monitors.iter().map(|entry| entry.clone()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }

    async fn delete_monitor(&self, id: &str) -> Result<()> {
        self.monitors.remove(id);
        Ok(())
    }

    async fn record_delivery(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut log = self.deliveries.write().unwrap();
        if let Some(existing) = log.iter_mut().find(|row| {
            row.alert_id == attempt.alert_id
                && row.webhook_id == attempt.webhook_id
                && row.attempt == attempt.attempt
        }) {
            *existing = attempt;
        } else {
            log.push_back(attempt);
            while log.len() > DELIVERY_LOG_CAP {
                log.pop_front();
            }
        }
        Ok(())
    }

    async fn delivery_log(&self, alert_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let log = self.deliveries.read().unwrap();
        Ok(log
            .iter()
            .filter(|row| row.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn put_schedule(&self, schedule: Schedule) -> Result<()> {
        self.schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.get(id).map(|entry| entry.clone()))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> =
            self.schedules.iter().map(|entry| entry.clone()).collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        self.schedules.remove(id);
        Ok(())
    }

    async fn record_run(&self, run: ScheduleRun) -> Result<()> {
        let mut runs = self.runs.write().unwrap();
        if let Some(existing) = runs.iter_mut().find(|row| row.id == run.id) {
            *existing = run;
            return Ok(());
        }

        let schedule_id = run.schedule_id.clone();
        runs.push_back(run);

        // Trim oldest runs of this schedule beyond the retention count
        let kept = runs
            .iter()
            .filter(|row| row.schedule_id == schedule_id)
            .count();
        if kept > RUNS_PER_SCHEDULE {
            let mut to_drop = kept - RUNS_PER_SCHEDULE;
            runs.retain(|row| {
                if to_drop > 0 && row.schedule_id == schedule_id {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok(())
    }

    async fn runs_for(&self, schedule_id: &str, limit: usize) -> Result<Vec<ScheduleRun>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .iter()
            .rev()
            .filter(|row| row.schedule_id == schedule_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        {
            let mut log = self.deliveries.write().unwrap();
            let before = log.len();
            log.retain(|row| row.attempted_at >= older_than);
            removed += (before - log.len()) as u64;
        }
        {
            let mut runs = self.runs.write().unwrap();
            let before = runs.len();
            runs.retain(|row| row.finished_at >= older_than);
            removed += (before - runs.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricKind, TimeWindow, WorkloadKey};
    use crate::monitor::MonitorStatus;
    use crate::notify::DeliveryOutcome;
    use crate::schedule::{RunKind, RunOutcome, TriggerKind};

    fn handle(id: &str) -> MonitorHandle {
        MonitorHandle {
            id: id.to_string(),
            selector: WorkloadKey::new("prod", "api", "web"),
            metrics: vec![MetricKind::CpuUsage],
            window: TimeWindow::Hours1,
            poll_interval_secs: 60,
            status: MonitorStatus::Running,
            started_at: Utc::now(),
            last_evaluated_at: None,
            last_error: None,
            evaluations: 0,
            findings: 0,
        }
    }

    fn run(id: &str, schedule_id: &str, finished_at: DateTime<Utc>) -> ScheduleRun {
        ScheduleRun {
            id: id.to_string(),
            schedule_id: schedule_id.to_string(),
            run_kind: RunKind::Analysis,
            trigger: TriggerKind::Cron,
            started_at: finished_at - chrono::Duration::seconds(1),
            finished_at,
            outcome: RunOutcome::Success,
            summary: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_monitor_crud() {
        let store = MemoryStore::new();
        store.put_monitor(handle("mon-b")).await.unwrap();
        store.put_monitor(handle("mon-a")).await.unwrap();

        assert!(store.get_monitor("mon-a").await.unwrap().is_some());
        assert!(store.get_monitor("mon-z").await.unwrap().is_none());

        let listed = store.list_monitors().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "mon-a");

        store.delete_monitor("mon-a").await.unwrap();
        assert!(store.get_monitor("mon-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delivery_upsert_replaces_same_attempt() {
        let store = MemoryStore::new();
        let mut attempt = DeliveryAttempt::pending("whk-1", "alrt-1", 1);
        store.record_delivery(attempt.clone()).await.unwrap();

        attempt.outcome = DeliveryOutcome::Success;
        attempt.response_status = Some(200);
        store.record_delivery(attempt).await.unwrap();

        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, DeliveryOutcome::Success);
        assert_eq!(log[0].response_status, Some(200));
    }

    #[tokio::test]
    async fn test_delivery_attempts_form_a_lineage() {
        let store = MemoryStore::new();
        for attempt_no in 1..=3 {
            let mut attempt = DeliveryAttempt::pending("whk-1", "alrt-1", attempt_no);
            attempt.outcome = if attempt_no == 3 {
                DeliveryOutcome::Success
            } else {
                DeliveryOutcome::Failed
            };
            store.record_delivery(attempt).await.unwrap();
        }
        // Another alert's rows do not leak into the trail
        store
            .record_delivery(DeliveryAttempt::pending("whk-1", "alrt-2", 1))
            .await
            .unwrap();

        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].attempt, 1);
        assert_eq!(log[2].attempt, 3);
        assert_eq!(log[2].outcome, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn test_delivery_log_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..(DELIVERY_LOG_CAP + 10) {
            store
                .record_delivery(DeliveryAttempt::pending("whk-1", &format!("alrt-{i}"), 1))
                .await
                .unwrap();
        }
        let total = store.deliveries.read().unwrap().len();
        assert_eq!(total, DELIVERY_LOG_CAP);
        // The oldest rows were the ones dropped
        assert!(store.delivery_log("alrt-0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runs_trimmed_per_schedule() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..(RUNS_PER_SCHEDULE + 5) {
            store
                .record_run(run(
                    &format!("run-{i}"),
                    "sch-1",
                    now + chrono::Duration::seconds(i as i64),
                ))
                .await
                .unwrap();
        }
        store.record_run(run("run-other", "sch-2", now)).await.unwrap();

        let all = store.runs_for("sch-1", usize::MAX).await.unwrap();
        assert_eq!(all.len(), RUNS_PER_SCHEDULE);
        // Oldest of sch-1 trimmed, sch-2 untouched
        assert!(all.iter().all(|r| r.id != "run-0"));
        assert_eq!(store.runs_for("sch-2", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runs_for_newest_first_with_limit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store
                .record_run(run(
                    &format!("run-{i}"),
                    "sch-1",
                    now + chrono::Duration::seconds(i),
                ))
                .await
                .unwrap();
        }

        let recent = store.runs_for("sch-1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "run-4");
        assert_eq!(recent[1].id, "run-3");
    }

    #[tokio::test]
    async fn test_prune_drops_only_old_records() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut old_delivery = DeliveryAttempt::pending("whk-1", "alrt-old", 1);
        old_delivery.attempted_at = now - chrono::Duration::days(30);
        store.record_delivery(old_delivery).await.unwrap();
        store
            .record_delivery(DeliveryAttempt::pending("whk-1", "alrt-new", 1))
            .await
            .unwrap();

        store
            .record_run(run("run-old", "sch-1", now - chrono::Duration::days(30)))
            .await
            .unwrap();
        store.record_run(run("run-new", "sch-1", now)).await.unwrap();

        let removed = store.prune(now - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.delivery_log("alrt-old").await.unwrap().is_empty());
        assert_eq!(store.delivery_log("alrt-new").await.unwrap().len(), 1);
        assert_eq!(store.runs_for("sch-1", 10).await.unwrap().len(), 1);
    }
}
