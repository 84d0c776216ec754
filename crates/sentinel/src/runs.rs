//! Scheduled run execution
//!
//! Maps each run kind onto the live engine: analysis sweeps re-evaluate
//! workloads on demand, collection warms source queries, reports roll up
//! recent findings and cleanup prunes aged store records.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sentinel_lib::{
    models::{Alert, MetricKind, Severity, TimeWindow, WorkloadKey},
    monitor::{MonitorSpec, MonitorSupervisor},
    notify::NotificationDispatcher,
    schedule::{RunHandler, RunKind},
    source::MetricsSource,
    store::RecordStore,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Executes scheduled runs against the engine
pub struct EngineRunHandler {
    supervisor: Arc<MonitorSupervisor>,
    source: Arc<dyn MetricsSource>,
    dispatcher: Arc<NotificationDispatcher>,
    store: Arc<dyn RecordStore>,
}

/// Workload selection shared by analysis and collection runs
///
/// An empty workload list means "whatever is currently monitored".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SweepParams {
    workloads: Vec<WorkloadKey>,
    /// Metrics to evaluate; empty uses the monitor defaults
    metrics: Vec<MetricKind>,
    window: Option<TimeWindow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReportParams {
    /// Publish an operational alert when the score drops below this
    alert_below: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CleanupParams {
    /// Delivery and run records older than this are dropped
    retain_hours: i64,
}

impl Default for CleanupParams {
    fn default() -> Self {
        Self { retain_hours: 24 }
    }
}

/// Null params fall back to the kind's defaults; anything else must parse
fn parse_params<T>(params: &Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).context("invalid run params")
}

impl EngineRunHandler {
    pub fn new(
        supervisor: Arc<MonitorSupervisor>,
        source: Arc<dyn MetricsSource>,
        dispatcher: Arc<NotificationDispatcher>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            supervisor,
            source,
            dispatcher,
            store,
        }
    }

    fn resolve_specs(&self, params: &SweepParams) -> Vec<MonitorSpec> {
        if params.workloads.is_empty() {
            return self
                .supervisor
                .list()
                .into_iter()
                .map(|handle| MonitorSpec {
                    selector: handle.selector,
                    metrics: handle.metrics,
                    window: handle.window,
                    poll_interval_secs: handle.poll_interval_secs,
                })
                .collect();
        }

        params
            .workloads
            .iter()
            .map(|key| {
                let mut spec = MonitorSpec::new(key.clone());
                if !params.metrics.is_empty() {
                    spec.metrics = params.metrics.clone();
                }
                if let Some(window) = params.window {
                    spec.window = window;
                }
                spec
            })
            .collect()
    }

    async fn run_analysis(&self, params: &Value) -> Result<String> {
        let params: SweepParams = parse_params(params)?;
        let specs = self.resolve_specs(&params);
        if specs.is_empty() {
            return Ok("no workloads to evaluate".to_string());
        }

        let mut raised = 0usize;
        let mut failed = 0usize;
        for spec in &specs {
            match self.supervisor.evaluate_workload(spec).await {
                Ok(count) => raised += count,
                Err(e) => {
                    failed += 1;
                    debug!(workload = %spec.selector, error = %e, "Analysis evaluation failed");
                }
            }
        }

        if failed == specs.len() {
            bail!("all {failed} evaluations failed");
        }
        let mut summary =
            format!("evaluated {} workloads, raised {} findings", specs.len(), raised);
        if failed > 0 {
            summary.push_str(&format!(", {failed} failed"));
        }
        Ok(summary)
    }

    async fn run_collection(&self, params: &Value) -> Result<String> {
        let params: SweepParams = parse_params(params)?;
        let specs = self.resolve_specs(&params);
        if specs.is_empty() {
            return Ok("no workloads to collect".to_string());
        }

        let mut series = 0usize;
        let mut points = 0usize;
        let mut failed = 0usize;
        for spec in &specs {
            for metric in &spec.metrics {
                match self.source.query(&spec.selector, *metric, spec.window).await {
                    Ok(fetched) => {
                        series += 1;
                        points += fetched.len();
                    }
                    Err(e) => {
                        failed += 1;
                        debug!(
                            workload = %spec.selector,
                            metric = %metric,
                            error = %e,
                            "Collection query failed"
                        );
                    }
                }
            }
        }

        if series == 0 && failed > 0 {
            bail!("all {failed} collection queries failed");
        }
        let mut summary = format!("collected {series} series ({points} points)");
        if failed > 0 {
            summary.push_str(&format!(", {failed} queries failed"));
        }
        Ok(summary)
    }

    async fn run_report(&self, params: &Value) -> Result<String> {
        let params: ReportParams = parse_params(params)?;
        let snapshot = self.supervisor.health_snapshot();
        let monitors = self.supervisor.list().len();

        let summary = format!(
            "health score {:.1} across {} monitors: {} findings in the last hour ({} critical, {} high, {} medium, {} low)",
            snapshot.score,
            monitors,
            snapshot.recent_findings,
            snapshot.critical,
            snapshot.high,
            snapshot.medium,
            snapshot.low,
        );

        if let Some(floor) = params.alert_below {
            if snapshot.score < floor {
                let alert = Alert::operational(
                    Severity::High,
                    format!("Workload health score dropped to {:.1}", snapshot.score),
                    summary.clone(),
                );
                self.dispatcher.publish(alert).await;
            }
        }

        Ok(summary)
    }

    async fn run_cleanup(&self, params: &Value) -> Result<String> {
        let params: CleanupParams = parse_params(params)?;
        let cutoff = Utc::now() - chrono::Duration::hours(params.retain_hours);
        let removed = self.store.prune(cutoff).await?;
        Ok(format!("pruned {} records older than {}h", removed, params.retain_hours))
    }
}

#[async_trait]
impl RunHandler for EngineRunHandler {
    async fn execute(&self, kind: RunKind, params: &Value) -> Result<String> {
        match kind {
            RunKind::Analysis => self.run_analysis(params).await,
            RunKind::Collection => self.run_collection(params).await,
            RunKind::Report => self.run_report(params).await,
            RunKind::Cleanup => self.run_cleanup(params).await,
        }
    }
}
