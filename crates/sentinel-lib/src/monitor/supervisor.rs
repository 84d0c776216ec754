//! Monitor supervision
//!
//! Owns one polling task per monitor. Each cycle fetches the configured
//! metric series, runs trend analysis and the detection rules, and
//! publishes an alert for every finding that survives the cooldown gate.
//! A periodic sweep reaps loops that died without a stop request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use super::{MonitorHandle, MonitorSpec, MonitorStatus};
use crate::analysis::{
    health_score, AnomalyDetector, BaselineStats, DetectorConfig, EvaluationContext, TrendAnalyzer,
    TrendConfig,
};
use crate::models::{
    generate_id, Alert, Finding, MetricKind, PatternKind, Severity, TimeWindow, WorkloadKey,
};
use crate::notify::NotificationDispatcher;
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::source::MetricsSource;
use crate::store::RecordStore;

/// Findings older than this no longer count against the health score
const HEALTH_LOOKBACK_SECS: i64 = 3600;

/// Supervisor-level tuning shared by all monitor loops
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Timeout for one source query
    pub fetch_timeout: Duration,
    /// Suppression window for repeat findings on the same workload,
    /// metric and pattern
    pub cooldown: Duration,
    /// How often dead loops are reaped
    pub sweep_interval: Duration,
    /// Bound on the retained findings log
    pub max_active_findings: usize,
    /// Longer window fetched for baseline stats when it differs from a
    /// monitor's own window
    pub baseline_window: TimeWindow,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            cooldown: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_active_findings: 500,
            baseline_window: TimeWindow::Hours24,
        }
    }
}

/// Key for cooldown suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    key: WorkloadKey,
    metric: MetricKind,
    pattern: PatternKind,
}

/// Suppresses repeat findings for the same workload, metric and pattern
/// within a fixed window
struct CooldownGate {
    window: Duration,
    recent: RwLock<HashMap<CooldownKey, Instant>>,
}

impl CooldownGate {
    fn new(window: Duration) -> Self {
        Self {
            window,
            recent: RwLock::new(HashMap::new()),
        }
    }

    fn should_suppress(&self, finding: &Finding) -> bool {
        let key = CooldownKey {
            key: finding.key.clone(),
            metric: finding.metric,
            pattern: finding.pattern,
        };

        let recent = self.recent.read().unwrap();
        if let Some(last) = recent.get(&key) {
            last.elapsed() < self.window
        } else {
            false
        }
    }

    fn record(&self, finding: &Finding) {
        let key = CooldownKey {
            key: finding.key.clone(),
            metric: finding.metric,
            pattern: finding.pattern,
        };

        let mut recent = self.recent.write().unwrap();
        recent.insert(key, Instant::now());

        // Clean up expired entries
        recent.retain(|_, time| time.elapsed() < self.window);
    }
}

/// Internal state for one running monitor
struct MonitorEntry {
    id: String,
    spec: MonitorSpec,
    status: RwLock<MonitorStatus>,
    started_at: DateTime<Utc>,
    last_evaluated: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    evaluations: AtomicU64,
    findings: AtomicU64,
    stop_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorEntry {
    fn new(spec: MonitorSpec) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            id: generate_id("mon"),
            spec,
            status: RwLock::new(MonitorStatus::Starting),
            started_at: Utc::now(),
            last_evaluated: RwLock::new(None),
            last_error: RwLock::new(None),
            evaluations: AtomicU64::new(0),
            findings: AtomicU64::new(0),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn status(&self) -> MonitorStatus {
        *self.status.read().unwrap()
    }

    /// Move to `next` if the lifecycle allows it
    fn transition(&self, next: MonitorStatus) -> bool {
        let mut status = self.status.write().unwrap();
        if status.can_transition(next) {
            *status = next;
            true
        } else {
            false
        }
    }

    fn snapshot(&self) -> MonitorHandle {
        MonitorHandle {
            id: self.id.clone(),
            selector: self.spec.selector.clone(),
            metrics: self.spec.metrics.clone(),
            window: self.spec.window,
            poll_interval_secs: self.spec.poll_interval_secs,
            status: self.status(),
            started_at: self.started_at,
            last_evaluated_at: *self.last_evaluated.read().unwrap(),
            last_error: self.last_error.read().unwrap().clone(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            findings: self.findings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time rollup of recent findings
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// 100 minus severity-weighted penalties, floored at zero
    pub score: f64,
    pub recent_findings: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Registry and runner for monitor loops
pub struct MonitorSupervisor {
    config: MonitorConfig,
    source: Arc<dyn MetricsSource>,
    analyzer: TrendAnalyzer,
    detector: AnomalyDetector,
    dispatcher: Arc<NotificationDispatcher>,
    store: Arc<dyn RecordStore>,
    /// Map of monitor id -> entry
    monitors: DashMap<String, Arc<MonitorEntry>>,
    /// Map of selector -> monitor id, one monitor per workload
    by_selector: DashMap<WorkloadKey, String>,
    /// Recent findings, oldest dropped past the configured bound
    active_findings: RwLock<VecDeque<Finding>>,
    cooldowns: CooldownGate,
    /// Engine-wide stop signal for every loop
    shutdown: broadcast::Sender<()>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl MonitorSupervisor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn MetricsSource>,
        dispatcher: Arc<NotificationDispatcher>,
        store: Arc<dyn RecordStore>,
        logger: StructuredLogger,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        let cooldowns = CooldownGate::new(config.cooldown);
        Self {
            config,
            source,
            analyzer: TrendAnalyzer::new(TrendConfig::default()),
            detector: AnomalyDetector::new(DetectorConfig::default()),
            dispatcher,
            store,
            monitors: DashMap::new(),
            by_selector: DashMap::new(),
            active_findings: RwLock::new(VecDeque::new()),
            cooldowns,
            shutdown,
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    /// Replace the default trend analyzer
    pub fn with_analyzer(mut self, analyzer: TrendAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Replace the default detection rules
    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Start a monitor for the spec's selector
    ///
    /// A selector already under a live monitor returns that monitor's
    /// snapshot instead of starting a second loop.
    pub async fn start(self: &Arc<Self>, spec: MonitorSpec) -> Result<MonitorHandle> {
        if let Some(existing) = self.by_selector.get(&spec.selector) {
            if let Some(entry) = self.monitors.get(existing.value()) {
                debug!(
                    monitor_id = %entry.id,
                    selector = %spec.selector,
                    "Monitor already running for selector"
                );
                return Ok(entry.snapshot());
            }
        }

        let entry = Arc::new(MonitorEntry::new(spec));
        self.store.put_monitor(entry.snapshot()).await?;

        self.monitors.insert(entry.id.clone(), entry.clone());
        self.by_selector
            .insert(entry.spec.selector.clone(), entry.id.clone());
        self.metrics.set_monitors_active(self.live_count());

        // Subscribe before spawning so a stop or shutdown fired in the
        // gap is not lost
        let stop_rx = entry.stop_tx.subscribe();
        let shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn({
            let supervisor = Arc::clone(self);
            let entry = Arc::clone(&entry);
            async move {
                supervisor.run_monitor(entry, stop_rx, shutdown_rx).await;
            }
        });
        *entry.task.lock().unwrap() = Some(task);

        self.logger.log_monitor_transition(
            &entry.id,
            &entry.spec.selector.to_string(),
            "starting",
        );
        Ok(entry.snapshot())
    }

    /// Stop a monitor, await its loop and drop its records
    pub async fn stop(&self, id: &str) -> Result<MonitorHandle> {
        let entry = match self.monitors.get(id) {
            Some(entry) => entry.value().clone(),
            None => bail!("unknown monitor: {id}"),
        };

        if entry.transition(MonitorStatus::Stopping) {
            self.logger.log_monitor_transition(
                &entry.id,
                &entry.spec.selector.to_string(),
                "stopping",
            );
        }
        let _ = entry.stop_tx.send(());

        let task = entry.task.lock().unwrap().take();
        if let Some(task) = task {
            match task.await {
                Ok(()) => {
                    entry.transition(MonitorStatus::Stopped);
                }
                Err(e) => {
                    warn!(monitor_id = %id, error = %e, "Monitor task join failed");
                    entry.transition(MonitorStatus::Errored);
                }
            }
        } else {
            entry.transition(MonitorStatus::Stopped);
        }

        self.monitors.remove(id);
        self.by_selector.remove(&entry.spec.selector);
        self.metrics.set_monitors_active(self.live_count());
        if let Err(e) = self.store.delete_monitor(id).await {
            warn!(monitor_id = %id, error = %e, "Failed to remove monitor record");
        }

        let handle = entry.snapshot();
        self.logger.log_monitor_transition(
            &entry.id,
            &entry.spec.selector.to_string(),
            &handle.status.to_string(),
        );
        Ok(handle)
    }

    /// Snapshot of one monitor, if known
    pub fn get(&self, id: &str) -> Option<MonitorHandle> {
        self.monitors.get(id).map(|entry| entry.snapshot())
    }

    /// Snapshots of every known monitor, ordered by id
    pub fn list(&self) -> Vec<MonitorHandle> {
        let mut handles: Vec<MonitorHandle> =
            self.monitors.iter().map(|entry| entry.snapshot()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Findings currently retained, oldest first
    pub fn active_findings(&self) -> Vec<Finding> {
        self.active_findings
            .read()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }

    /// Health rollup over findings raised in the last hour
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let cutoff = Utc::now() - chrono::Duration::seconds(HEALTH_LOOKBACK_SECS);
        let log = self.active_findings.read().unwrap();
        let recent: Vec<Finding> = log
            .iter()
            .filter(|finding| finding.detected_at > cutoff)
            .cloned()
            .collect();
        let count_of =
            |severity: Severity| recent.iter().filter(|f| f.severity == severity).count();
        HealthSnapshot {
            score: health_score(&recent),
            recent_findings: recent.len(),
            critical: count_of(Severity::Critical),
            high: count_of(Severity::High),
            medium: count_of(Severity::Medium),
            low: count_of(Severity::Low),
        }
    }

    /// One-shot evaluation of a workload, outside any monitor loop
    ///
    /// Findings flow through the same cooldown, log and dispatch path the
    /// loops use. Returns the number of findings raised.
    pub async fn evaluate_workload(&self, spec: &MonitorSpec) -> Result<usize> {
        let mut raised = 0;
        for metric in &spec.metrics {
            raised += self.evaluate_metric(spec, *metric).await?;
        }
        Ok(raised)
    }

    /// Mark loops that exited without a stop request as errored and free
    /// their selectors
    pub async fn sweep(&self) {
        let mut dead: Vec<Arc<MonitorEntry>> = Vec::new();
        for entry in self.monitors.iter() {
            let finished = entry
                .task
                .lock()
                .unwrap()
                .as_ref()
                .map(|task| task.is_finished())
                .unwrap_or(false);
            let status = entry.status();
            if finished && !status.is_terminal() && status != MonitorStatus::Stopping {
                dead.push(entry.value().clone());
            }
        }

        for entry in dead {
            entry.transition(MonitorStatus::Errored);
            *entry.last_error.write().unwrap() =
                Some("monitor loop exited unexpectedly".to_string());
            self.by_selector.remove(&entry.spec.selector);
            self.logger.log_monitor_errored(
                &entry.id,
                &entry.spec.selector.to_string(),
                "monitor loop exited unexpectedly",
            );
            if let Err(e) = self.store.put_monitor(entry.snapshot()).await {
                warn!(monitor_id = %entry.id, error = %e, "Failed to persist errored monitor");
            }
        }
        self.metrics.set_monitors_active(self.live_count());
    }

    /// Run the periodic sweep until shutdown, then stop every loop
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Starting monitor supervisor"
        );

        let mut ticker = interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down monitor supervisor");
                    break;
                }
            }
        }

        self.stop_all().await;
    }

    /// Stop every known monitor; used on shutdown
    pub async fn stop_all(&self) {
        let _ = self.shutdown.send(());
        let ids: Vec<String> = self.monitors.iter().map(|entry| entry.id.clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                debug!(monitor_id = %id, error = %e, "Stop during shutdown failed");
            }
        }
    }

    fn live_count(&self) -> i64 {
        self.monitors
            .iter()
            .filter(|entry| !entry.status().is_terminal())
            .count() as i64
    }

    async fn run_monitor(
        self: Arc<Self>,
        entry: Arc<MonitorEntry>,
        mut stop_rx: broadcast::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        if entry.transition(MonitorStatus::Running) {
            self.logger.log_monitor_transition(
                &entry.id,
                &entry.spec.selector.to_string(),
                "running",
            );
        }

        let mut ticker = interval(entry.spec.poll_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_monitor(&entry).await;
                }
                _ = stop_rx.recv() => {
                    debug!(monitor_id = %entry.id, "Monitor loop stopping");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    debug!(monitor_id = %entry.id, "Monitor loop stopping on engine shutdown");
                    break;
                }
            }
        }
    }

    /// One evaluation cycle over every metric the spec names
    async fn evaluate_monitor(&self, entry: &MonitorEntry) {
        let start = Instant::now();
        let mut cycle_findings = 0usize;
        let mut cycle_error: Option<String> = None;

        for metric in &entry.spec.metrics {
            match self.evaluate_metric(&entry.spec, *metric).await {
                Ok(raised) => cycle_findings += raised,
                Err(e) => {
                    self.metrics.inc_evaluation_errors();
                    debug!(
                        monitor_id = %entry.id,
                        metric = %metric,
                        error = %e,
                        "Evaluation failed"
                    );
                    cycle_error = Some(format!("{}: {:#}", metric, e));
                }
            }
        }

        entry.evaluations.fetch_add(1, Ordering::Relaxed);
        if cycle_findings > 0 {
            entry
                .findings
                .fetch_add(cycle_findings as u64, Ordering::Relaxed);
        }
        *entry.last_evaluated.write().unwrap() = Some(Utc::now());
        *entry.last_error.write().unwrap() = cycle_error;

        self.metrics.inc_evaluations();
        self.metrics
            .observe_evaluation_latency(start.elapsed().as_secs_f64());

        // The store carries the snapshot the API serves
        if let Err(e) = self.store.put_monitor(entry.snapshot()).await {
            warn!(monitor_id = %entry.id, error = %e, "Failed to persist monitor snapshot");
        }
    }

    /// Fetch, analyze and dispatch for one metric; returns findings raised
    async fn evaluate_metric(&self, spec: &MonitorSpec, metric: MetricKind) -> Result<usize> {
        let series = timeout(
            self.config.fetch_timeout,
            self.source.query(&spec.selector, metric, spec.window),
        )
        .await
        .map_err(|_| anyhow::anyhow!("source query timed out"))??;

        let trend = self.analyzer.analyze(&series);

        // A longer window gives the rules a steadier baseline; skip the
        // extra fetch when the monitor already evaluates that window, and
        // fall back to series-derived stats when the fetch fails
        let baseline = if spec.window != self.config.baseline_window {
            match timeout(
                self.config.fetch_timeout,
                self.source
                    .query(&spec.selector, metric, self.config.baseline_window),
            )
            .await
            {
                Ok(Ok(longer)) => BaselineStats::from_values(&longer.values()),
                _ => None,
            }
        } else {
            None
        };

        let limit = self.source.limit(&spec.selector, metric).await.ok().flatten();
        let restarts = if metric == MetricKind::MemoryUsage {
            self.source.restarts(&spec.selector, spec.window).await.ok()
        } else {
            None
        };

        let ctx = EvaluationContext {
            series: &series,
            trend: &trend,
            baseline: baseline.as_ref(),
            limit,
            restarts,
        };

        let mut raised = 0;
        for finding in self.detector.evaluate(&ctx) {
            if self.cooldowns.should_suppress(&finding) {
                debug!(
                    workload = %finding.key,
                    metric = %finding.metric,
                    pattern = %finding.pattern,
                    "Finding suppressed by cooldown"
                );
                continue;
            }
            self.cooldowns.record(&finding);
            self.record_finding(&finding);
            self.dispatcher.publish(Alert::from_finding(&finding)).await;
            raised += 1;
        }
        Ok(raised)
    }

    /// Append to the bounded findings log and bump counters
    fn record_finding(&self, finding: &Finding) {
        self.metrics.inc_findings(finding.pattern.as_str());
        self.logger.log_finding(finding);

        let mut log = self.active_findings.write().unwrap();
        log.push_back(finding.clone());
        while log.len() > self.config.max_active_findings {
            log.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Evidence, SamplePoint, SampleSeries};
    use crate::notify::{
        ChannelKind, DeliveryError, DispatchConfig, WebhookConfig, WebhookRequest,
        WebhookResponse, WebhookTransport,
    };
    use crate::source::StaticSource;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    const BASE_TS: i64 = 1_700_000_000;

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

    fn test_key() -> WorkloadKey {
        WorkloadKey::new("prod", "api", "web")
    }

    fn leaky_series(key: &WorkloadKey) -> SampleSeries {
        let mut series =
            SampleSeries::new(key.clone(), MetricKind::MemoryUsage, TimeWindow::Hours1);
        for i in 0..21 {
            series.points.push(SamplePoint::new(
                Utc.timestamp_opt(BASE_TS + i * 3600, 0).unwrap(),
                100.0 + 20.0 * i as f64,
            ));
        }
        series
    }

    fn flat_series(key: &WorkloadKey, metric: MetricKind) -> SampleSeries {
        let mut series = SampleSeries::new(key.clone(), metric, TimeWindow::Hours1);
        for i in 0..12 {
            series.points.push(SamplePoint::new(
                Utc.timestamp_opt(BASE_TS + i * 300, 0).unwrap(),
                50.0,
            ));
        }
        series
    }

    async fn fixture(
        source: Arc<StaticSource>,
    ) -> (
        Arc<MonitorSupervisor>,
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

        let supervisor = Arc::new(MonitorSupervisor::new(
            MonitorConfig::default(),
            source,
            dispatcher,
            store.clone(),
            StructuredLogger::new("test"),
        ));
        (supervisor, store, transport)
    }

    fn memory_spec(key: WorkloadKey) -> MonitorSpec {
        let mut spec = MonitorSpec::new(key);
        spec.metrics = vec![MetricKind::MemoryUsage];
        spec
    }

    #[test]
    fn test_cooldown_gate_expires() {
        let gate = CooldownGate::new(Duration::from_millis(30));
        let evidence = Evidence {
            rule: "leak_slope".to_string(),
            observed: 1.0,
            expected: None,
            threshold: 0.5,
            score: 0.8,
        };
        let finding = Finding::new(
            test_key(),
            MetricKind::MemoryUsage,
            PatternKind::MemoryLeak,
            Severity::High,
            evidence.clone(),
            "memory rising",
        );

        assert!(!gate.should_suppress(&finding));
        gate.record(&finding);
        assert!(gate.should_suppress(&finding));

        // Same workload, different pattern passes
        let drift = Finding::new(
            test_key(),
            MetricKind::MemoryUsage,
            PatternKind::ResourceDrift,
            Severity::Low,
            evidence,
            "memory drifting",
        );
        assert!(!gate.should_suppress(&drift));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!gate.should_suppress(&finding));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_selector() {
        let source = Arc::new(StaticSource::new());
        source.load_series(flat_series(&test_key(), MetricKind::MemoryUsage));
        let (supervisor, _store, _transport) = fixture(source).await;

        let first = supervisor.start(memory_spec(test_key())).await.unwrap();
        let second = supervisor.start(memory_spec(test_key())).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(supervisor.list().len(), 1);

        supervisor.stop(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_leak_finding_reaches_webhook() {
        let key = test_key();
        let source = Arc::new(StaticSource::new());
        source.load_series(leaky_series(&key));
        let (supervisor, store, transport) = fixture(source).await;

        let handle = supervisor.start(memory_spec(key)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let findings = supervisor.active_findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pattern, PatternKind::MemoryLeak);
        assert_eq!(findings[0].severity, Severity::Critical);

        let snapshot = supervisor.health_snapshot();
        assert_eq!(snapshot.score, 70.0);
        assert_eq!(snapshot.critical, 1);
        assert_eq!(snapshot.recent_findings, 1);

        let stored = store.get_monitor(&handle.id).await.unwrap().unwrap();
        assert!(stored.evaluations >= 1);
        assert_eq!(stored.findings, 1);

        supervisor.stop(&handle.id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_findings() {
        let key = test_key();
        let source = Arc::new(StaticSource::new());
        source.load_series(leaky_series(&key));
        let (supervisor, _store, transport) = fixture(source).await;

        let mut spec = memory_spec(key);
        spec.poll_interval_secs = 1;
        let handle = supervisor.start(spec).await.unwrap();

        // Three poll cycles on virtual time; the cooldown window runs on
        // real time, so the repeats stay suppressed
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active_findings().len(), 1);
        let got = supervisor.get(&handle.id).unwrap();
        assert!(got.evaluations >= 3);

        supervisor.stop(&handle.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_source_error_recorded_not_fatal() {
        let source = Arc::new(StaticSource::new());
        let (supervisor, _store, transport) = fixture(source).await;

        let mut spec = MonitorSpec::new(test_key());
        spec.metrics = vec![MetricKind::CpuUsage];
        let handle = supervisor.start(spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let got = supervisor.get(&handle.id).unwrap();
        assert_eq!(got.status, MonitorStatus::Running);
        assert!(got.evaluations >= 1);
        assert_eq!(got.findings, 0);
        assert!(got.last_error.unwrap().contains("no series loaded"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        supervisor.stop(&handle.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_removes_monitor_and_record() {
        let source = Arc::new(StaticSource::new());
        source.load_series(flat_series(&test_key(), MetricKind::MemoryUsage));
        let (supervisor, store, _transport) = fixture(source).await;

        let handle = supervisor.start(memory_spec(test_key())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = supervisor.stop(&handle.id).await.unwrap();
        assert_eq!(stopped.status, MonitorStatus::Stopped);
        assert!(supervisor.get(&handle.id).is_none());
        assert!(supervisor.list().is_empty());
        assert!(store.get_monitor(&handle.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_monitor_fails() {
        let source = Arc::new(StaticSource::new());
        let (supervisor, _store, _transport) = fixture(source).await;
        assert!(supervisor.stop("mon-missing").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_marks_dead_loop_errored() {
        let key = test_key();
        let source = Arc::new(StaticSource::new());
        source.load_series(flat_series(&key, MetricKind::MemoryUsage));
        let (supervisor, _store, _transport) = fixture(source).await;

        let handle = supervisor.start(memory_spec(key.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Kill the loop out from under the supervisor
        let entry = supervisor.monitors.get(&handle.id).unwrap().value().clone();
        if let Some(task) = entry.task.lock().unwrap().as_ref() {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.sweep().await;

        let got = supervisor.get(&handle.id).unwrap();
        assert_eq!(got.status, MonitorStatus::Errored);
        assert!(got.last_error.is_some());

        // Selector freed so a replacement can start
        assert!(!supervisor.by_selector.contains_key(&key));
        let replacement = supervisor.start(memory_spec(key)).await.unwrap();
        assert_ne!(replacement.id, handle.id);
        supervisor.stop(&replacement.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_monitor() {
        let source = Arc::new(StaticSource::new());
        source.load_series(flat_series(&test_key(), MetricKind::MemoryUsage));
        let other = WorkloadKey::new("prod", "worker", "app");
        source.load_series(flat_series(&other, MetricKind::MemoryUsage));
        let (supervisor, _store, _transport) = fixture(source).await;

        supervisor.start(memory_spec(test_key())).await.unwrap();
        supervisor.start(memory_spec(other)).await.unwrap();
        assert_eq!(supervisor.list().len(), 2);

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(Arc::clone(&supervisor).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        task.await.unwrap();

        assert!(supervisor.list().is_empty());
    }

    #[tokio::test]
    async fn test_health_snapshot_defaults_to_perfect() {
        let source = Arc::new(StaticSource::new());
        let (supervisor, _store, _transport) = fixture(source).await;

        let snapshot = supervisor.health_snapshot();
        assert_eq!(snapshot.score, 100.0);
        assert_eq!(snapshot.recent_findings, 0);
        assert_eq!(snapshot.critical, 0);
    }
}
