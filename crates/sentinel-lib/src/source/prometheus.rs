//! Prometheus-backed metrics source
//!
//! Series come from `/api/v1/query_range`; limits and restart counts come
//! from instant queries. Workloads are matched by the `pod=~"<workload>-.*"`
//! convention, so pods of one Deployment/StatefulSet aggregate into one
//! series via `sum(...)`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use crate::models::{MetricKind, SamplePoint, SampleSeries, TimeWindow, WorkloadKey};

use super::MetricsSource;

/// Connection settings for the Prometheus HTTP API
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: "http://prometheus:9090".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Range-query PromQL for one workload metric
pub fn promql_for(metric: MetricKind, key: &WorkloadKey) -> String {
    match metric {
        MetricKind::CpuUsage => format!(
            "sum(rate(container_cpu_usage_seconds_total{{namespace=\"{}\", pod=~\"{}-.*\", container=\"{}\"}}[5m]))",
            key.namespace, key.workload, key.container
        ),
        MetricKind::MemoryUsage => format!(
            "sum(container_memory_working_set_bytes{{namespace=\"{}\", pod=~\"{}-.*\", container=\"{}\"}})",
            key.namespace, key.workload, key.container
        ),
        // cAdvisor network metrics carry no container label
        MetricKind::NetworkReceive => format!(
            "sum(rate(container_network_receive_bytes_total{{namespace=\"{}\", pod=~\"{}-.*\"}}[5m]))",
            key.namespace, key.workload
        ),
        MetricKind::NetworkTransmit => format!(
            "sum(rate(container_network_transmit_bytes_total{{namespace=\"{}\", pod=~\"{}-.*\"}}[5m]))",
            key.namespace, key.workload
        ),
        MetricKind::PodRestarts => format!(
            "sum(kube_pod_container_status_restarts_total{{namespace=\"{}\", pod=~\"{}-.*\", container=\"{}\"}})",
            key.namespace, key.workload, key.container
        ),
    }
}

/// Instant-query PromQL for the configured limit, where one exists
fn limit_promql(metric: MetricKind, key: &WorkloadKey) -> Option<String> {
    let resource = match metric {
        MetricKind::CpuUsage => "cpu",
        MetricKind::MemoryUsage => "memory",
        _ => return None,
    };
    Some(format!(
        "max(kube_pod_container_resource_limits{{namespace=\"{}\", pod=~\"{}-.*\", container=\"{}\", resource=\"{}\"}})",
        key.namespace, key.workload, key.container, resource
    ))
}

/// Restarts accumulated over the window
fn restarts_promql(key: &WorkloadKey, window: TimeWindow) -> String {
    format!(
        "sum(increase(kube_pod_container_status_restarts_total{{namespace=\"{}\", pod=~\"{}-.*\", container=\"{}\"}}[{}]))",
        key.namespace, key.workload, key.container, window.as_str()
    )
}

/// Query resolution: about 100 points per window, never finer than 15s
fn step_seconds(window: TimeWindow) -> u64 {
    (window.seconds() / 100).max(15)
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    result: Vec<PromResult>,
}

#[derive(Debug, Deserialize)]
struct PromResult {
    /// Range queries: list of `[unix_ts, "value"]` pairs
    #[serde(default)]
    values: Vec<(f64, String)>,
    /// Instant queries: single `[unix_ts, "value"]` pair
    #[serde(default)]
    value: Option<(f64, String)>,
}

fn parse_range_body(
    body: &str,
    key: &WorkloadKey,
    metric: MetricKind,
    window: TimeWindow,
) -> Result<SampleSeries> {
    let response: PromResponse =
        serde_json::from_str(body).context("malformed Prometheus response")?;
    if response.status != "success" {
        bail!(
            "Prometheus range query failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let mut series = SampleSeries::new(key.clone(), metric, window);
    let result = response
        .data
        .map(|data| data.result)
        .unwrap_or_default()
        .into_iter()
        .next();
    if let Some(result) = result {
        for (ts, raw) in result.values {
            let value: f64 = raw
                .parse()
                .with_context(|| format!("non-numeric sample {raw:?}"))?;
            let timestamp = Utc
                .timestamp_opt(ts as i64, 0)
                .single()
                .context("sample timestamp out of range")?;
            series.points.push(SamplePoint::new(timestamp, value));
        }
    }
    Ok(series)
}

fn parse_instant_body(body: &str) -> Result<Option<f64>> {
    let response: PromResponse =
        serde_json::from_str(body).context("malformed Prometheus response")?;
    if response.status != "success" {
        bail!(
            "Prometheus query failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let value = response
        .data
        .map(|data| data.result)
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|result| result.value)
        .map(|(_, raw)| raw.parse::<f64>())
        .transpose()
        .context("non-numeric instant value")?;
    Ok(value)
}

/// Metrics source over the Prometheus HTTP API
pub struct PrometheusSource {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusSource {
    pub fn new(config: PrometheusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build Prometheus HTTP client")?;
        Ok(Self { config, client })
    }

    async fn get_text(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("Prometheus request to {path} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read Prometheus response body")?;
        if !status.is_success() {
            bail!("Prometheus returned {status}: {body}");
        }
        Ok(body)
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn query(
        &self,
        key: &WorkloadKey,
        metric: MetricKind,
        window: TimeWindow,
    ) -> Result<SampleSeries> {
        let end = Utc::now();
        let start = end - chrono::Duration::seconds(window.seconds() as i64);
        let params = [
            ("query", promql_for(metric, key)),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{}s", step_seconds(window))),
        ];

        let body = self.get_text("/api/v1/query_range", &params).await?;
        parse_range_body(&body, key, metric, window)
    }

    async fn limit(&self, key: &WorkloadKey, metric: MetricKind) -> Result<Option<f64>> {
        let promql = match limit_promql(metric, key) {
            Some(promql) => promql,
            None => return Ok(None),
        };
        let body = self.get_text("/api/v1/query", &[("query", promql)]).await?;
        parse_instant_body(&body)
    }

    async fn restarts(&self, key: &WorkloadKey, window: TimeWindow) -> Result<u64> {
        let body = self
            .get_text("/api/v1/query", &[("query", restarts_promql(key, window))])
            .await?;
        // increase() extrapolates fractionally; round to whole restarts
        Ok(parse_instant_body(&body)?
            .map(|v| v.max(0.0).round() as u64)
            .unwrap_or(0))
    }
}
