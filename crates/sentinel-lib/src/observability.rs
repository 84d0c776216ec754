//! Observability infrastructure for the monitoring engine
//!
//! Provides:
//! - Prometheus metrics (evaluation latency, delivery latency, run outcomes)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_gauge, register_int_gauge_vec, Histogram, IntGauge,
    IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::Finding;

/// Histogram buckets for in-process evaluation work (in seconds)
const EVALUATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Histogram buckets for outbound requests and scheduled runs (in seconds)
const OUTBOUND_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct EngineMetricsInner {
    evaluation_latency_seconds: Histogram,
    delivery_latency_seconds: Histogram,
    run_duration_seconds: Histogram,
    evaluations_total: IntGauge,
    evaluation_errors_total: IntGauge,
    findings_total: IntGaugeVec,
    delivery_attempts_total: IntGauge,
    delivery_failures_total: IntGauge,
    deliveries_exhausted_total: IntGauge,
    schedule_runs_total: IntGaugeVec,
    monitors_active: IntGauge,
    schedules_paused: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            evaluation_latency_seconds: register_histogram!(
                "workload_sentinel_evaluation_latency_seconds",
                "Time spent evaluating one metric series against the rules",
                EVALUATION_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            delivery_latency_seconds: register_histogram!(
                "workload_sentinel_delivery_latency_seconds",
                "Time spent delivering one webhook request",
                OUTBOUND_BUCKETS.to_vec()
            )
            .expect("Failed to register delivery_latency_seconds"),

            run_duration_seconds: register_histogram!(
                "workload_sentinel_run_duration_seconds",
                "Wall time of scheduled run executions",
                OUTBOUND_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),

            evaluations_total: register_int_gauge!(
                "workload_sentinel_evaluations_total",
                "Total number of monitor evaluations performed"
            )
            .expect("Failed to register evaluations_total"),

            evaluation_errors_total: register_int_gauge!(
                "workload_sentinel_evaluation_errors_total",
                "Total number of evaluations that failed before producing findings"
            )
            .expect("Failed to register evaluation_errors_total"),

            findings_total: register_int_gauge_vec!(
                "workload_sentinel_findings_total",
                "Total number of findings raised, by pattern",
                &["pattern"]
            )
            .expect("Failed to register findings_total"),

            delivery_attempts_total: register_int_gauge!(
                "workload_sentinel_delivery_attempts_total",
                "Total number of webhook delivery attempts"
            )
            .expect("Failed to register delivery_attempts_total"),

            delivery_failures_total: register_int_gauge!(
                "workload_sentinel_delivery_failures_total",
                "Total number of failed webhook delivery attempts"
            )
            .expect("Failed to register delivery_failures_total"),

            deliveries_exhausted_total: register_int_gauge!(
                "workload_sentinel_deliveries_exhausted_total",
                "Deliveries abandoned after the retry budget was spent"
            )
            .expect("Failed to register deliveries_exhausted_total"),

            schedule_runs_total: register_int_gauge_vec!(
                "workload_sentinel_schedule_runs_total",
                "Total number of scheduled runs, by outcome",
                &["outcome"]
            )
            .expect("Failed to register schedule_runs_total"),

            monitors_active: register_int_gauge!(
                "workload_sentinel_monitors_active",
                "Number of monitors currently running"
            )
            .expect("Failed to register monitors_active"),

            schedules_paused: register_int_gauge!(
                "workload_sentinel_schedules_paused",
                "Number of schedules paused after repeated failures"
            )
            .expect("Failed to register schedules_paused"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    // This is just a marker - we use the global instance
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.inner().evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn observe_delivery_latency(&self, duration_secs: f64) {
        self.inner().delivery_latency_seconds.observe(duration_secs);
    }

    pub fn observe_run_duration(&self, duration_secs: f64) {
        self.inner().run_duration_seconds.observe(duration_secs);
    }

    pub fn inc_evaluations(&self) {
        self.inner().evaluations_total.inc();
    }

    pub fn inc_evaluation_errors(&self) {
        self.inner().evaluation_errors_total.inc();
    }

    pub fn inc_findings(&self, pattern: &str) {
        self.inner().findings_total.with_label_values(&[pattern]).inc();
    }

    pub fn inc_delivery_attempts(&self) {
        self.inner().delivery_attempts_total.inc();
    }

    pub fn inc_delivery_failures(&self) {
        self.inner().delivery_failures_total.inc();
    }

    pub fn inc_deliveries_exhausted(&self) {
        self.inner().deliveries_exhausted_total.inc();
    }

    pub fn inc_schedule_runs(&self, outcome: &str) {
        self.inner().schedule_runs_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_monitors_active(&self, count: i64) {
        self.inner().monitors_active.set(count);
    }

    pub fn set_schedules_paused(&self, count: i64) {
        self.inner().schedules_paused.set(count);
    }
}

/// Structured logger for engine events
///
/// Provides consistent JSON-formatted logging for findings, deliveries,
/// and monitor lifecycle changes.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a detected finding; severity picks the log level
    pub fn log_finding(&self, finding: &Finding) {
        match finding.severity {
            crate::models::Severity::Critical | crate::models::Severity::High => {
                warn!(
                    event = "finding_detected",
                    instance = %self.instance,
                    workload = %finding.key,
                    metric = %finding.metric,
                    pattern = %finding.pattern,
                    severity = %finding.severity,
                    rule = %finding.evidence.rule,
                    score = finding.evidence.score,
                    observed = finding.evidence.observed,
                    details = %finding.description,
                    "Finding detected"
                );
            }
            _ => {
                info!(
                    event = "finding_detected",
                    instance = %self.instance,
                    workload = %finding.key,
                    metric = %finding.metric,
                    pattern = %finding.pattern,
                    severity = %finding.severity,
                    rule = %finding.evidence.rule,
                    score = finding.evidence.score,
                    observed = finding.evidence.observed,
                    details = %finding.description,
                    "Finding detected"
                );
            }
        }
    }

    /// Log a monitor lifecycle transition
    pub fn log_monitor_transition(&self, monitor_id: &str, selector: &str, status: &str) {
        info!(
            event = "monitor_transition",
            instance = %self.instance,
            monitor_id = %monitor_id,
            selector = %selector,
            status = %status,
            "Monitor changed state"
        );
    }

    /// Log a monitor whose evaluation loop died
    pub fn log_monitor_errored(&self, monitor_id: &str, selector: &str, error: &str) {
        warn!(
            event = "monitor_errored",
            instance = %self.instance,
            monitor_id = %monitor_id,
            selector = %selector,
            error = %error,
            "Monitor loop terminated unexpectedly"
        );
    }

    /// Log a delivery abandoned after exhausting its retries
    pub fn log_delivery_exhausted(&self, webhook_id: &str, alert_id: &str, attempts: u32) {
        warn!(
            event = "delivery_exhausted",
            instance = %self.instance,
            webhook_id = %webhook_id,
            alert_id = %alert_id,
            attempts = attempts,
            "Webhook delivery abandoned after final retry"
        );
    }

    /// Log a schedule auto-paused after repeated failures
    pub fn log_schedule_paused(&self, schedule_id: &str, name: &str, failures: u32) {
        warn!(
            event = "schedule_paused",
            instance = %self.instance,
            schedule_id = %schedule_id,
            name = %name,
            consecutive_failures = failures,
            "Schedule paused after repeated failures"
        );
    }

    /// Log a completed scheduled run
    pub fn log_schedule_run(&self, schedule_id: &str, run_kind: &str, outcome: &str) {
        info!(
            event = "schedule_run",
            instance = %self.instance,
            schedule_id = %schedule_id,
            run_kind = %run_kind,
            outcome = %outcome,
            "Scheduled run finished"
        );
    }

    /// Log engine startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            "Workload sentinel started"
        );
    }

    /// Log engine shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Workload sentinel shutting down"
        );
    }
}
