//! Core data models for the monitoring engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identifies one monitored unit: (namespace, workload, container)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub workload: String,
    pub container: String,
}

impl WorkloadKey {
    pub fn new(
        namespace: impl Into<String>,
        workload: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            workload: workload.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.workload, self.container)
    }
}

/// Metric families served by a metrics source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuUsage,
    MemoryUsage,
    NetworkReceive,
    NetworkTransmit,
    PodRestarts,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUsage => "cpu_usage",
            MetricKind::MemoryUsage => "memory_usage",
            MetricKind::NetworkReceive => "network_receive",
            MetricKind::NetworkTransmit => "network_transmit",
            MetricKind::PodRestarts => "pod_restarts",
        }
    }

    /// Whether samples for this metric are byte counts (affects payload formatting)
    pub fn is_bytes(&self) -> bool {
        matches!(
            self,
            MetricKind::MemoryUsage | MetricKind::NetworkReceive | MetricKind::NetworkTransmit
        )
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query window presets for sampling and baselines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "5m")]
    Minutes5,
    #[serde(rename = "15m")]
    Minutes15,
    #[serde(rename = "30m")]
    Minutes30,
    #[serde(rename = "1h")]
    Hours1,
    #[serde(rename = "6h")]
    Hours6,
    #[serde(rename = "12h")]
    Hours12,
    #[serde(rename = "24h")]
    Hours24,
}

impl TimeWindow {
    pub fn seconds(&self) -> u64 {
        match self {
            TimeWindow::Minutes5 => 300,
            TimeWindow::Minutes15 => 900,
            TimeWindow::Minutes30 => 1800,
            TimeWindow::Hours1 => 3600,
            TimeWindow::Hours6 => 21600,
            TimeWindow::Hours12 => 43200,
            TimeWindow::Hours24 => 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Minutes5 => "5m",
            TimeWindow::Minutes15 => "15m",
            TimeWindow::Minutes30 => "30m",
            TimeWindow::Hours1 => "1h",
            TimeWindow::Hours6 => "6h",
            TimeWindow::Hours12 => "12h",
            TimeWindow::Hours24 => "24h",
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed value at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl SamplePoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Ordered samples for one metric of one workload over one window.
///
/// Immutable once fetched; every consumer must cope with 0, 1, or N points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSeries {
    pub key: WorkloadKey,
    pub metric: MetricKind,
    pub window: TimeWindow,
    pub points: Vec<SamplePoint>,
}

impl SampleSeries {
    pub fn new(key: WorkloadKey, metric: MetricKind, window: TimeWindow) -> Self {
        Self {
            key,
            metric,
            window,
            points: Vec::new(),
        }
    }

    pub fn with_points(
        key: WorkloadKey,
        metric: MetricKind,
        window: TimeWindow,
        points: Vec<SamplePoint>,
    ) -> Self {
        Self {
            key,
            metric,
            window,
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn latest(&self) -> Option<&SamplePoint> {
        self.points.last()
    }

    /// Seconds covered by the samples actually present, not the requested window
    pub fn span_seconds(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        }
    }
}

/// Four-level severity scale, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Penalty applied to the workload health score per finding
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 5.0,
            Severity::Medium => 10.0,
            Severity::High => 20.0,
            Severity::Critical => 30.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of anomaly patterns the detector can classify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    MemoryLeak,
    /// Short-lived burst above the established baseline (any metric)
    CpuSpike,
    ResourceDrift,
    Saturation,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::MemoryLeak => "memory_leak",
            PatternKind::CpuSpike => "cpu_spike",
            PatternKind::ResourceDrift => "resource_drift",
            PatternKind::Saturation => "saturation",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numbers backing a classification, kept alongside the finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Which detection rule fired
    pub rule: String,
    pub observed: f64,
    /// Baseline or predicted reference value, when one exists
    pub expected: Option<f64>,
    pub threshold: f64,
    /// Normalized rule strength in 0..=1
    pub score: f64,
}

/// One anomaly detection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub key: WorkloadKey,
    pub metric: MetricKind,
    pub pattern: PatternKind,
    pub severity: Severity,
    pub evidence: Evidence,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        key: WorkloadKey,
        metric: MetricKind,
        pattern: PatternKind,
        severity: Severity,
        evidence: Evidence,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id("fnd"),
            key,
            metric,
            pattern,
            severity,
            evidence,
            description: description.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Payload unit handed to the notification dispatcher.
///
/// Produced from every finding, and directly by components that need to
/// raise operational notices (schedule auto-pause) without inventing a
/// fake anomaly pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub workload: Option<WorkloadKey>,
    pub metric: Option<MetricKind>,
    pub pattern: Option<PatternKind>,
    /// Extra key/value context rendered as channel fields
    pub facts: Vec<(String, String)>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_finding(finding: &Finding) -> Self {
        let title = match finding.pattern {
            PatternKind::MemoryLeak => format!("Memory leak suspected in {}", finding.key),
            PatternKind::CpuSpike => {
                format!("{} spike detected in {}", finding.metric, finding.key)
            }
            PatternKind::ResourceDrift => {
                format!("{} drifting in {}", finding.metric, finding.key)
            }
            PatternKind::Saturation => {
                format!("{} approaching its limit in {}", finding.metric, finding.key)
            }
        };
        let mut facts = vec![
            ("pattern".to_string(), finding.pattern.to_string()),
            ("metric".to_string(), finding.metric.to_string()),
            ("rule".to_string(), finding.evidence.rule.clone()),
            (
                "observed".to_string(),
                format!("{:.3}", finding.evidence.observed),
            ),
            (
                "score".to_string(),
                format!("{:.2}", finding.evidence.score),
            ),
        ];
        if let Some(expected) = finding.evidence.expected {
            facts.push(("expected".to_string(), format!("{:.3}", expected)));
        }
        Self {
            id: finding.id.clone(),
            severity: finding.severity,
            title,
            body: finding.description.clone(),
            workload: Some(finding.key.clone()),
            metric: Some(finding.metric),
            pattern: Some(finding.pattern),
            facts,
            raised_at: finding.detected_at,
        }
    }

    pub fn operational(
        severity: Severity,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id("alrt"),
            severity,
            title: title.into(),
            body: body.into(),
            workload: None,
            metric: None,
            pattern: None,
            facts: Vec::new(),
            raised_at: Utc::now(),
        }
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique id: prefix, epoch seconds, and a monotonic counter
pub fn generate_id(prefix: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}{:x}-{:x}", prefix, now.as_secs(), now.subsec_nanos(), seq)
}
