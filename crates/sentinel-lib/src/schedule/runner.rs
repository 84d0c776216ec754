//! Schedule execution
//!
//! Drives cron schedules: a ticker finds due schedules, runs them through
//! the handler under a timeout, and applies the failure-streak policy.
//! A streak of failures pauses the schedule and raises an operational
//! alert so the pause does not go unnoticed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use super::{RunHandler, RunOutcome, Schedule, ScheduleRun, TriggerKind};
use crate::models::{generate_id, Alert, Severity};
use crate::notify::NotificationDispatcher;
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::store::RecordStore;

/// Runner-level tuning
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// How often due schedules are checked
    pub tick_interval: Duration,
    /// Hard cap on one run
    pub run_timeout: Duration,
    /// Failure streak that pauses a schedule
    pub max_consecutive_failures: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(300),
            max_consecutive_failures: 3,
        }
    }
}

/// The cron crate wants six fields; schedules are written with the usual
/// five, so seconds are pinned to zero
fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        bail!("cron expression must have 5 fields, got {fields}");
    }
    Ok(format!("0 {}", expr.trim()))
}

/// Next occurrence strictly after `now`, in UTC
fn next_occurrence(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_cron(expr)?;
    let parsed = CronSchedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression: {expr}"))?;
    parsed
        .after(&now)
        .next()
        .context("cron expression has no future occurrence")
}

/// Registry and executor for cron schedules
pub struct ScheduleRunner {
    config: ScheduleConfig,
    handler: Arc<dyn RunHandler>,
    dispatcher: Arc<NotificationDispatcher>,
    store: Arc<dyn RecordStore>,
    schedules: RwLock<HashMap<String, Schedule>>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl ScheduleRunner {
    pub fn new(
        config: ScheduleConfig,
        handler: Arc<dyn RunHandler>,
        dispatcher: Arc<NotificationDispatcher>,
        store: Arc<dyn RecordStore>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            config,
            handler,
            dispatcher,
            store,
            schedules: RwLock::new(HashMap::new()),
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    /// Validate the cron expression and register the schedule
    ///
    /// An enabled schedule gets its first due time here; a disabled one
    /// stays dormant until enabled.
    pub async fn register(&self, mut schedule: Schedule) -> Result<Schedule> {
        schedule.next_due = if schedule.enabled {
            Some(next_occurrence(&schedule.cron, Utc::now())?)
        } else {
            None
        };

        self.store.put_schedule(schedule.clone()).await?;
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            cron = %schedule.cron,
            run_kind = %schedule.run_kind,
            "Schedule registered"
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: &str) -> Option<Schedule> {
        self.schedules.read().await.get(id).cloned()
    }

    /// All schedules, oldest first
    pub async fn list(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        all.sort_by_key(|schedule| schedule.created_at);
        all
    }

    pub async fn remove(&self, id: &str) -> Result<Schedule> {
        let removed = self.schedules.write().await.remove(id);
        match removed {
            Some(schedule) => {
                self.store.delete_schedule(id).await?;
                info!(schedule_id = %id, "Schedule removed");
                Ok(schedule)
            }
            None => bail!("unknown schedule: {id}"),
        }
    }

    /// Enable or disable; disabling clears the due time, enabling
    /// recomputes it
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Schedule> {
        let snapshot = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules
                .get_mut(id)
                .with_context(|| format!("unknown schedule: {id}"))?;
            schedule.enabled = enabled;
            schedule.next_due = if enabled && !schedule.paused {
                Some(next_occurrence(&schedule.cron, Utc::now())?)
            } else {
                None
            };
            schedule.clone()
        };
        self.store.put_schedule(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Manually pause; paused schedules never come due
    pub async fn pause(&self, id: &str) -> Result<Schedule> {
        let snapshot = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules
                .get_mut(id)
                .with_context(|| format!("unknown schedule: {id}"))?;
            schedule.paused = true;
            schedule.next_due = None;
            schedule.clone()
        };
        self.store.put_schedule(snapshot.clone()).await?;
        self.refresh_paused_gauge().await;
        Ok(snapshot)
    }

    /// Clear a pause (manual or automatic), reset the failure streak and
    /// recompute the due time
    pub async fn resume(&self, id: &str) -> Result<Schedule> {
        let snapshot = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules
                .get_mut(id)
                .with_context(|| format!("unknown schedule: {id}"))?;
            schedule.paused = false;
            schedule.consecutive_failures = 0;
            if schedule.enabled {
                schedule.next_due = Some(next_occurrence(&schedule.cron, Utc::now())?);
            }
            schedule.clone()
        };
        self.store.put_schedule(snapshot.clone()).await?;
        self.refresh_paused_gauge().await;
        Ok(snapshot)
    }

    /// Fire a schedule immediately, outside its cron cadence
    ///
    /// A disabled schedule records a skipped run instead of executing.
    /// A paused one still runs; the manual trigger is the operator's
    /// override.
    pub async fn trigger_now(&self, id: &str) -> Result<ScheduleRun> {
        let schedule = self
            .get(id)
            .await
            .with_context(|| format!("unknown schedule: {id}"))?;

        if !schedule.enabled {
            let now = Utc::now();
            let run = ScheduleRun {
                id: generate_id("run"),
                schedule_id: schedule.id.clone(),
                run_kind: schedule.run_kind,
                trigger: TriggerKind::Manual,
                started_at: now,
                finished_at: now,
                outcome: RunOutcome::Skipped,
                summary: Some("schedule is disabled".to_string()),
                error: None,
            };
            self.store.record_run(run.clone()).await?;
            self.metrics.inc_schedule_runs(run.outcome.as_str());
            self.logger.log_schedule_run(
                &run.schedule_id,
                &run.run_kind.to_string(),
                run.outcome.as_str(),
            );
            return Ok(run);
        }

        self.execute_run(&schedule, TriggerKind::Manual, Utc::now())
            .await
    }

    /// Execute every due schedule; returns how many ran
    ///
    /// `now` is injectable so due checks are testable without waiting on
    /// wall-clock cron boundaries.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Schedule> = {
            let schedules = self.schedules.read().await;
            schedules
                .values()
                .filter(|schedule| schedule.is_due(now))
                .cloned()
                .collect()
        };

        let mut ran = 0;
        for schedule in due {
            match self.execute_run(&schedule, TriggerKind::Cron, now).await {
                Ok(run) => {
                    debug!(
                        schedule_id = %schedule.id,
                        outcome = run.outcome.as_str(),
                        "Scheduled run complete"
                    );
                    ran += 1;
                }
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "Scheduled run bookkeeping failed"
                    );
                }
            }
        }
        ran
    }

    /// Run the tick loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "Starting schedule runner"
        );

        let mut ticker = interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ran = self.tick(Utc::now()).await;
                    if ran > 0 {
                        debug!(runs = ran, "Tick complete");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down schedule runner");
                    break;
                }
            }
        }
    }

    /// Run the handler once and apply the outcome to the schedule
    ///
    /// `now` anchors the next-due recompute so cron-driven and injected
    /// ticks advance the schedule the same way.
    async fn execute_run(
        &self,
        schedule: &Schedule,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<ScheduleRun> {
        let started_at = Utc::now();
        let start = Instant::now();

        let result = match timeout(
            self.config.run_timeout,
            self.handler.execute(schedule.run_kind, &schedule.params),
        )
        .await
        {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err("run timed out".to_string()),
        };

        let run = ScheduleRun {
            id: generate_id("run"),
            schedule_id: schedule.id.clone(),
            run_kind: schedule.run_kind,
            trigger,
            started_at,
            finished_at: Utc::now(),
            outcome: if result.is_ok() {
                RunOutcome::Success
            } else {
                RunOutcome::Failure
            },
            summary: result.as_ref().ok().cloned(),
            error: result.err(),
        };

        self.apply_outcome(&run, now).await?;

        self.metrics
            .observe_run_duration(start.elapsed().as_secs_f64());
        self.metrics.inc_schedule_runs(run.outcome.as_str());
        self.logger.log_schedule_run(
            &run.schedule_id,
            &run.run_kind.to_string(),
            run.outcome.as_str(),
        );
        self.store.record_run(run.clone()).await?;

        Ok(run)
    }

    /// Schedule bookkeeping after a run: streaks, auto-pause, next due time
    async fn apply_outcome(&self, run: &ScheduleRun, now: DateTime<Utc>) -> Result<()> {
        let mut paused_now: Option<Schedule> = None;
        let snapshot = {
            let mut schedules = self.schedules.write().await;
            let schedule = match schedules.get_mut(&run.schedule_id) {
                Some(schedule) => schedule,
                // Removed while running; nothing left to update
                None => return Ok(()),
            };

            schedule.last_run_at = Some(run.finished_at);
            schedule.run_count += 1;
            match run.outcome {
                RunOutcome::Success => {
                    schedule.consecutive_failures = 0;
                }
                RunOutcome::Failure => {
                    schedule.failure_count += 1;
                    schedule.consecutive_failures += 1;
                    if schedule.consecutive_failures >= self.config.max_consecutive_failures
                        && !schedule.paused
                    {
                        schedule.paused = true;
                        paused_now = Some(schedule.clone());
                    }
                }
                RunOutcome::Skipped => {}
            }

            if schedule.enabled && !schedule.paused {
                match next_occurrence(&schedule.cron, now) {
                    Ok(due) => schedule.next_due = Some(due),
                    Err(e) => {
                        warn!(
                            schedule_id = %schedule.id,
                            error = %e,
                            "Failed to recompute due time"
                        );
                        schedule.next_due = None;
                    }
                }
            } else {
                schedule.next_due = None;
            }

            schedule.clone()
        };

        self.store.put_schedule(snapshot).await?;

        if let Some(paused) = paused_now {
            self.refresh_paused_gauge().await;
            self.logger
                .log_schedule_paused(&paused.id, &paused.name, paused.consecutive_failures);
            let alert = Alert::operational(
                Severity::Critical,
                format!("Schedule {} paused after repeated failures", paused.name),
                format!(
                    "Schedule {} failed {} consecutive runs and was paused. \
                     Resume it once the underlying failure is fixed. Last error: {}",
                    paused.name,
                    paused.consecutive_failures,
                    run.error.as_deref().unwrap_or("unknown")
                ),
            );
            self.dispatcher.publish(alert).await;
        }
        Ok(())
    }

    async fn refresh_paused_gauge(&self) {
        let paused = self
            .schedules
            .read()
            .await
            .values()
            .filter(|schedule| schedule.paused)
            .count() as i64;
        self.metrics.set_schedules_paused(paused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{
        ChannelKind, DeliveryError, DispatchConfig, WebhookConfig, WebhookRequest,
        WebhookResponse, WebhookTransport,
    };
    use crate::schedule::RunKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for CountingTransport {
        async fn deliver(
            &self,
            _request: &WebhookRequest,
        ) -> Result<WebhookResponse, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WebhookResponse {
                status: 200,
                retry_after: None,
            })
        }
    }

    /// Scripted handler; runs succeed once the script is exhausted
    struct MockHandler {
        calls: AtomicUsize,
        results: Mutex<VecDeque<Result<String, String>>>,
    }

    impl MockHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                results: Mutex::new(VecDeque::new()),
            }
        }

        fn ok(self, summary: &str) -> Self {
            self.results
                .lock()
                .unwrap()
                .push_back(Ok(summary.to_string()));
            self
        }

        fn fail(self, error: &str) -> Self {
            self.results
                .lock()
                .unwrap()
                .push_back(Err(error.to_string()));
            self
        }
    }

    #[async_trait]
    impl RunHandler for MockHandler {
        async fn execute(
            &self,
            _kind: RunKind,
            _params: &serde_json::Value,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(summary)) => Ok(summary),
                Some(Err(error)) => anyhow::bail!(error),
                None => Ok("ok".to_string()),
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl RunHandler for SlowHandler {
        async fn execute(
            &self,
            _kind: RunKind,
            _params: &serde_json::Value,
        ) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    async fn fixture(
        handler: Arc<dyn RunHandler>,
    ) -> (
        Arc<ScheduleRunner>,
        Arc<MemoryStore>,
        Arc<CountingTransport>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            DispatchConfig::default(),
            transport.clone(),
            store.clone(),
            StructuredLogger::new("test"),
        ));
        dispatcher
            .register(WebhookConfig::new(
                "ops",
                ChannelKind::Generic,
                "https://hooks.test/ops",
            ))
            .await;

        let runner = Arc::new(ScheduleRunner::new(
            ScheduleConfig::default(),
            handler,
            dispatcher,
            store.clone(),
            StructuredLogger::new("test"),
        ));
        (runner, store, transport)
    }

    #[test]
    fn test_normalize_cron_pins_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert!(normalize_cron("* * * *").is_err());
        assert!(normalize_cron("0 0 * * * *").is_err());
    }

    #[test]
    fn test_next_occurrence_advances() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 30).unwrap();
        let next = next_occurrence("*/15 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap());

        assert!(next_occurrence("not a cron", now).is_err());
        assert!(next_occurrence("99 * * * *", now).is_err());
    }

    #[tokio::test]
    async fn test_register_validates_cron() {
        let (runner, store, _transport) = fixture(Arc::new(MockHandler::new())).await;

        let bad = Schedule::new("hourly-report", "99 * * * *", RunKind::Report);
        assert!(runner.register(bad).await.is_err());

        let good = Schedule::new("hourly-report", "0 * * * *", RunKind::Report);
        let registered = runner.register(good).await.unwrap();
        assert!(registered.next_due.is_some());
        assert!(store
            .get_schedule(&registered.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_manual_trigger_records_success() {
        let handler = Arc::new(MockHandler::new().ok("pruned 3 records"));
        let (runner, store, _transport) = fixture(handler.clone()).await;

        let schedule = runner
            .register(Schedule::new("nightly-cleanup", "0 3 * * *", RunKind::Cleanup))
            .await
            .unwrap();

        let run = runner.trigger_now(&schedule.id).await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.trigger, TriggerKind::Manual);
        assert_eq!(run.summary.as_deref(), Some("pruned 3 records"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let updated = runner.get(&schedule.id).await.unwrap();
        assert_eq!(updated.run_count, 1);
        assert_eq!(updated.consecutive_failures, 0);
        assert!(updated.last_run_at.is_some());

        let runs = store.runs_for(&schedule.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Success);
    }

    #[tokio::test]
    async fn test_failure_streak_pauses_schedule() {
        let handler = Arc::new(
            MockHandler::new()
                .fail("boom 1")
                .fail("boom 2")
                .fail("boom 3"),
        );
        let (runner, _store, transport) = fixture(handler).await;

        let schedule = runner
            .register(Schedule::new(
                "cluster-analysis",
                "*/5 * * * *",
                RunKind::Analysis,
            ))
            .await
            .unwrap();

        for _ in 0..3 {
            let run = runner.trigger_now(&schedule.id).await.unwrap();
            assert_eq!(run.outcome, RunOutcome::Failure);
        }

        let paused = runner.get(&schedule.id).await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.consecutive_failures, 3);
        assert_eq!(paused.failure_count, 3);
        assert!(paused.next_due.is_none());

        // Paused schedules never come due
        assert_eq!(runner.tick(Utc::now() + chrono::Duration::hours(1)).await, 0);

        // The pause raises an operational alert
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let resumed = runner.resume(&schedule.id).await.unwrap();
        assert!(!resumed.paused);
        assert_eq!(resumed.consecutive_failures, 0);
        assert!(resumed.next_due.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let handler = Arc::new(MockHandler::new().fail("boom").fail("boom").ok("recovered"));
        let (runner, _store, _transport) = fixture(handler).await;

        let schedule = runner
            .register(Schedule::new("collect", "*/5 * * * *", RunKind::Collection))
            .await
            .unwrap();

        runner.trigger_now(&schedule.id).await.unwrap();
        runner.trigger_now(&schedule.id).await.unwrap();
        let after_two = runner.get(&schedule.id).await.unwrap();
        assert_eq!(after_two.consecutive_failures, 2);
        assert!(!after_two.paused);

        runner.trigger_now(&schedule.id).await.unwrap();
        let recovered = runner.get(&schedule.id).await.unwrap();
        assert_eq!(recovered.consecutive_failures, 0);
        assert_eq!(recovered.failure_count, 2);
        assert_eq!(recovered.run_count, 3);
        assert!(!recovered.paused);
    }

    #[tokio::test]
    async fn test_disabled_schedule_skips_manual_trigger() {
        let handler = Arc::new(MockHandler::new());
        let (runner, store, _transport) = fixture(handler.clone()).await;

        let schedule = runner
            .register(Schedule::new("report", "0 8 * * *", RunKind::Report))
            .await
            .unwrap();
        let disabled = runner.set_enabled(&schedule.id, false).await.unwrap();
        assert!(disabled.next_due.is_none());

        let run = runner.trigger_now(&schedule.id).await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Skipped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let runs = store.runs_for(&schedule.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Skipped);

        // Re-enabling restores the due time
        let enabled = runner.set_enabled(&schedule.id, true).await.unwrap();
        assert!(enabled.next_due.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_counts_as_failure() {
        let (runner, _store, _transport) = fixture(Arc::new(SlowHandler)).await;

        let schedule = runner
            .register(Schedule::new("analysis", "*/5 * * * *", RunKind::Analysis))
            .await
            .unwrap();

        let run = runner.trigger_now(&schedule.id).await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Failure);
        assert_eq!(run.error.as_deref(), Some("run timed out"));

        let updated = runner.get(&schedule.id).await.unwrap();
        assert_eq!(updated.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_tick_runs_due_schedules() {
        let handler = Arc::new(MockHandler::new().ok("done"));
        let (runner, _store, _transport) = fixture(handler.clone()).await;

        let schedule = runner
            .register(Schedule::new("collect", "*/5 * * * *", RunKind::Collection))
            .await
            .unwrap();
        let due_at = schedule.next_due.unwrap();

        // Not yet due
        assert_eq!(
            runner.tick(due_at - chrono::Duration::seconds(1)).await,
            0
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        // Due now
        assert_eq!(runner.tick(due_at).await, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // The due time advanced past the fired occurrence
        let updated = runner.get(&schedule.id).await.unwrap();
        assert!(updated.next_due.unwrap() > due_at);
        assert_eq!(updated.run_count, 1);
    }

    #[tokio::test]
    async fn test_remove_schedule() {
        let (runner, store, _transport) = fixture(Arc::new(MockHandler::new())).await;

        let schedule = runner
            .register(Schedule::new("cleanup", "0 3 * * *", RunKind::Cleanup))
            .await
            .unwrap();
        runner.remove(&schedule.id).await.unwrap();

        assert!(runner.get(&schedule.id).await.is_none());
        assert!(store.get_schedule(&schedule.id).await.unwrap().is_none());
        assert!(runner.remove(&schedule.id).await.is_err());
    }

    #[tokio::test]
    async fn test_run_loop_shuts_down() {
        let (runner, _store, _transport) = fixture(Arc::new(MockHandler::new())).await;

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(Arc::clone(&runner).run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
