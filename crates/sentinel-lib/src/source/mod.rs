//! Metric acquisition for monitored workloads
//!
//! The supervisor pulls series through [`MetricsSource`]; Prometheus is the
//! production backend and [`StaticSource`] serves local runs and tests.

pub mod prometheus;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::{MetricKind, SampleSeries, TimeWindow, WorkloadKey};

pub use prometheus::{PrometheusConfig, PrometheusSource};

/// Where metric series come from
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch the sample series for one workload metric over a window
    async fn query(
        &self,
        key: &WorkloadKey,
        metric: MetricKind,
        window: TimeWindow,
    ) -> Result<SampleSeries>;

    /// Configured resource limit for the metric, when the source knows one
    async fn limit(&self, _key: &WorkloadKey, _metric: MetricKind) -> Result<Option<f64>> {
        Ok(None)
    }

    /// Container restarts over the window; sources without the signal report none
    async fn restarts(&self, _key: &WorkloadKey, _window: TimeWindow) -> Result<u64> {
        Ok(0)
    }
}

/// Preloaded in-memory source
///
/// Serves whatever series were loaded, ignoring the requested window. Used
/// when no Prometheus endpoint is configured and throughout the test suite.
pub struct StaticSource {
    series: DashMap<(WorkloadKey, MetricKind), SampleSeries>,
    limits: DashMap<(WorkloadKey, MetricKind), f64>,
    restarts: DashMap<WorkloadKey, u64>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            limits: DashMap::new(),
            restarts: DashMap::new(),
        }
    }

    pub fn load_series(&self, series: SampleSeries) {
        self.series
            .insert((series.key.clone(), series.metric), series);
    }

    pub fn set_limit(&self, key: WorkloadKey, metric: MetricKind, limit: f64) {
        self.limits.insert((key, metric), limit);
    }

    pub fn set_restarts(&self, key: WorkloadKey, count: u64) {
        self.restarts.insert(key, count);
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for StaticSource {
    async fn query(
        &self,
        key: &WorkloadKey,
        metric: MetricKind,
        _window: TimeWindow,
    ) -> Result<SampleSeries> {
        match self.series.get(&(key.clone(), metric)) {
            Some(series) => Ok(series.clone()),
            None => bail!("no series loaded for {key} {metric}"),
        }
    }

    async fn limit(&self, key: &WorkloadKey, metric: MetricKind) -> Result<Option<f64>> {
        Ok(self.limits.get(&(key.clone(), metric)).map(|v| *v))
    }

    async fn restarts(&self, key: &WorkloadKey, _window: TimeWindow) -> Result<u64> {
        Ok(self.restarts.get(key).map(|v| *v).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SamplePoint;
    use chrono::Utc;

    fn key() -> WorkloadKey {
        WorkloadKey::new("prod", "api", "web")
    }

    #[tokio::test]
    async fn test_loaded_series_round_trip() {
        let source = StaticSource::new();
        source.load_series(SampleSeries::with_points(
            key(),
            MetricKind::CpuUsage,
            TimeWindow::Hours1,
            vec![SamplePoint::new(Utc::now(), 0.5)],
        ));

        let series = source
            .query(&key(), MetricKind::CpuUsage, TimeWindow::Hours1)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.points[0].value, 0.5);
    }

    #[tokio::test]
    async fn test_missing_series_is_an_error() {
        let source = StaticSource::new();
        let err = source
            .query(&key(), MetricKind::MemoryUsage, TimeWindow::Hours1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no series loaded"));
    }

    #[tokio::test]
    async fn test_limit_and_restart_defaults() {
        let source = StaticSource::new();
        assert_eq!(source.limit(&key(), MetricKind::MemoryUsage).await.unwrap(), None);
        assert_eq!(source.restarts(&key(), TimeWindow::Hours24).await.unwrap(), 0);

        source.set_limit(key(), MetricKind::MemoryUsage, 1024.0);
        source.set_restarts(key(), 2);
        assert_eq!(source.limit(&key(), MetricKind::MemoryUsage).await.unwrap(), Some(1024.0));
        assert_eq!(source.restarts(&key(), TimeWindow::Hours24).await.unwrap(), 2);
    }
}
