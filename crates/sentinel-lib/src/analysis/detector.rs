//! Anomaly detection rules
//!
//! Each rule is a pure function over an [`EvaluationContext`] producing at
//! most one [`Finding`]; the detector composes them. Rules are independent:
//! several may fire on the same evaluation. A missing baseline, limit, or
//! restart signal disables the rules that need it instead of erroring.

use crate::analysis::stats::{self, BaselineStats};
use crate::analysis::trend::TrendResult;
use crate::models::{Evidence, Finding, MetricKind, PatternKind, SampleSeries, Severity};
use serde::{Deserialize, Serialize};

/// Detection thresholds; defaults match the shipped policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Standard deviations before the z-score rule fires
    pub z_score_threshold: f64,
    /// Tukey fence multiplier for the IQR rule
    pub iqr_multiplier: f64,
    /// Baseline samples needed before quartiles mean anything
    pub min_baseline_samples: usize,
    /// Samples needed before the spike rule runs
    pub spike_min_samples: usize,
    /// Z-score of the recent average before a spike is considered
    pub spike_z_entry: f64,
    /// Recent average must also exceed baseline p95 by this factor
    pub spike_p95_multiplier: f64,
    /// Spikes are not raised when the trend fit explains the rise
    pub spike_trend_r2_guard: f64,
    /// Samples needed before the leak rule runs
    pub leak_min_samples: usize,
    /// Minimum slope as a fraction of the mean, per hour
    pub leak_min_slope_ratio: f64,
    /// Minimum total rise over the window as a fraction of the start
    pub leak_min_total_rise: f64,
    /// Minimum fit quality for a leak classification
    pub leak_min_r_squared: f64,
    /// Minimum |slope|/mean per hour for the drift rule
    pub drift_min_slope_ratio: f64,
    /// Drift still needs a minimally credible fit
    pub drift_min_r_squared: f64,
    /// Fraction of the limit that counts as saturated
    pub saturation_ratio: f64,
    /// Samples needed before the saturation rule runs
    pub saturation_min_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_score_threshold: 3.0,
            iqr_multiplier: 1.5,
            min_baseline_samples: 4,
            spike_min_samples: 5,
            spike_z_entry: 2.5,
            spike_p95_multiplier: 1.5,
            spike_trend_r2_guard: 0.9,
            leak_min_samples: 10,
            leak_min_slope_ratio: 0.01,
            leak_min_total_rise: 0.10,
            leak_min_r_squared: 0.8,
            drift_min_slope_ratio: 0.01,
            drift_min_r_squared: 0.3,
            saturation_ratio: 0.90,
            saturation_min_samples: 3,
        }
    }
}

/// Everything one evaluation gets to look at
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub series: &'a SampleSeries,
    pub trend: &'a TrendResult,
    /// Stats from a longer historical window; when absent, rules fall back
    /// to stats over the evaluated series itself
    pub baseline: Option<&'a BaselineStats>,
    /// Configured resource limit for this metric, if known
    pub limit: Option<f64>,
    /// Container restarts observed over the window, if known
    pub restarts: Option<u64>,
}

/// Applies the detection rules to an evaluation context
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Run every applicable rule; zero findings is the common case.
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Vec<Finding> {
        let derived;
        let baseline = match ctx.baseline {
            Some(stats) => Some(stats),
            None => {
                derived = BaselineStats::from_values(&ctx.series.values());
                derived.as_ref()
            }
        };

        let mut findings = Vec::new();
        let rules = [
            z_score_rule,
            iqr_rule,
            spike_rule,
            leak_rule,
            drift_rule,
            saturation_rule,
        ];
        for rule in rules {
            if let Some(finding) = rule(&self.config, ctx, baseline) {
                findings.push(finding);
            }
        }
        findings
    }
}

/// Workload health score: 100 minus per-finding severity penalties, floor 0
pub fn health_score(findings: &[Finding]) -> f64 {
    let penalty: f64 = findings.iter().map(|f| f.severity.weight()).sum();
    (100.0 - penalty).max(0.0)
}

/// Latest sample beyond the configured z threshold against the baseline
fn z_score_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    let baseline = baseline?;
    let latest = ctx.series.latest()?;
    if baseline.count < config.min_baseline_samples {
        return None;
    }

    let z = baseline.z_score(latest.value);
    if z.abs() < config.z_score_threshold {
        return None;
    }

    let severity = if z.abs() >= config.z_score_threshold + 2.0 {
        Severity::Critical
    } else if z.abs() >= config.z_score_threshold + 1.0 {
        Severity::High
    } else {
        Severity::Medium
    };
    let score = (z.abs() / (config.z_score_threshold * 2.0)).min(1.0);

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::CpuSpike,
        severity,
        Evidence {
            rule: "z_score".to_string(),
            observed: latest.value,
            expected: Some(baseline.mean),
            threshold: config.z_score_threshold,
            score,
        },
        format!(
            "latest {} sample {:.2} is {:.1} standard deviations from the baseline mean {:.2}",
            ctx.series.metric, latest.value, z, baseline.mean
        ),
    ))
}

/// Latest sample outside the Tukey fences; robustness cross-check for z-score
fn iqr_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    let baseline = baseline?;
    let latest = ctx.series.latest()?;
    if baseline.count < config.min_baseline_samples {
        return None;
    }

    let iqr = baseline.iqr();
    let lower = baseline.q1 - config.iqr_multiplier * iqr;
    let upper = baseline.q3 + config.iqr_multiplier * iqr;
    if latest.value >= lower && latest.value <= upper {
        return None;
    }

    let excess = if latest.value > upper {
        latest.value - upper
    } else {
        lower - latest.value
    };
    let (severity, units) = if iqr > f64::EPSILON {
        let units = excess / iqr;
        let severity = if units >= 3.0 {
            Severity::High
        } else if units >= 1.0 {
            Severity::Medium
        } else {
            Severity::Low
        };
        (severity, units)
    } else {
        // Zero spread baseline: any excursion is already far outside
        (Severity::High, 4.0)
    };

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::CpuSpike,
        severity,
        Evidence {
            rule: "iqr".to_string(),
            observed: latest.value,
            expected: Some(baseline.mean),
            threshold: if latest.value > upper { upper } else { lower },
            score: (units / 4.0).min(1.0),
        },
        format!(
            "latest {} sample {:.2} falls outside the interquartile fences [{:.2}, {:.2}]",
            ctx.series.metric, latest.value, lower, upper
        ),
    ))
}

/// Recent average far above baseline and its p95, not explained by trend
fn spike_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    let baseline = baseline?;
    if ctx.series.len() < config.spike_min_samples {
        return None;
    }
    if ctx.trend.r_squared >= config.spike_trend_r2_guard {
        return None;
    }

    let values = ctx.series.values();
    let recent_n = values.len().min(3);
    let recent = stats::mean(&values[values.len() - recent_n..]);

    let z = baseline.z_score(recent);
    if z < config.spike_z_entry {
        return None;
    }
    if recent <= baseline.p95 * config.spike_p95_multiplier {
        return None;
    }

    let severity = if z > 4.0 {
        Severity::Critical
    } else if z > 3.0 {
        Severity::High
    } else {
        Severity::Medium
    };

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::CpuSpike,
        severity,
        Evidence {
            rule: "spike".to_string(),
            observed: recent,
            expected: Some(baseline.mean),
            threshold: baseline.p95 * config.spike_p95_multiplier,
            score: (z / (config.spike_z_entry * 2.0)).min(1.0),
        },
        format!(
            "recent {} average {:.2} spiked {:.1} standard deviations above baseline {:.2}",
            ctx.series.metric, recent, z, baseline.mean
        ),
    ))
}

/// Sustained well-fitted memory growth with no restart to explain it
fn leak_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    _baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    if ctx.series.metric != MetricKind::MemoryUsage {
        return None;
    }
    if ctx.series.len() < config.leak_min_samples {
        return None;
    }
    if ctx.restarts.unwrap_or(0) > 0 {
        return None;
    }

    let trend = ctx.trend;
    if trend.mean.abs() < f64::EPSILON || trend.slope_per_hour <= 0.0 {
        return None;
    }
    let slope_ratio = trend.slope_per_hour / trend.mean;
    if slope_ratio < config.leak_min_slope_ratio {
        return None;
    }

    let first = ctx.series.points.first()?.value;
    let last = ctx.series.points.last()?.value;
    if first < f64::EPSILON || (last - first) / first < config.leak_min_total_rise {
        return None;
    }
    if trend.r_squared < config.leak_min_r_squared {
        return None;
    }

    let severity = if slope_ratio >= 0.05 {
        Severity::Critical
    } else if slope_ratio >= 0.03 {
        Severity::High
    } else if slope_ratio >= 0.02 {
        Severity::Medium
    } else {
        Severity::Low
    };

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::MemoryLeak,
        severity,
        Evidence {
            rule: "memory_leak".to_string(),
            observed: slope_ratio,
            expected: None,
            threshold: config.leak_min_slope_ratio,
            score: (slope_ratio / 0.05).min(1.0),
        },
        format!(
            "memory rising {:.1}% per hour over {} samples (R² {:.2}, no restarts)",
            slope_ratio * 100.0,
            ctx.series.len(),
            trend.r_squared
        ),
    ))
}

/// Sustained slope that does not qualify as a leak
fn drift_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    _baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    if ctx.series.len() < config.leak_min_samples {
        return None;
    }
    let trend = ctx.trend;
    if trend.mean.abs() < f64::EPSILON {
        return None;
    }
    let slope_ratio = trend.slope_per_hour / trend.mean;
    if slope_ratio.abs() < config.drift_min_slope_ratio {
        return None;
    }
    // A noisy outlier can fake a slope; demand some fit before claiming drift
    if trend.r_squared < config.drift_min_r_squared {
        return None;
    }
    // Leak-qualifying growth is reported by the leak rule instead
    let leak_candidate = ctx.series.metric == MetricKind::MemoryUsage
        && trend.slope_per_hour > 0.0
        && trend.r_squared >= config.leak_min_r_squared
        && ctx.restarts.unwrap_or(0) == 0;
    if leak_candidate {
        return None;
    }

    let severity = if slope_ratio.abs() >= 0.05 {
        Severity::High
    } else if slope_ratio.abs() >= 0.02 {
        Severity::Medium
    } else {
        Severity::Low
    };
    let word = if slope_ratio > 0.0 { "growing" } else { "shrinking" };

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::ResourceDrift,
        severity,
        Evidence {
            rule: "resource_drift".to_string(),
            observed: slope_ratio,
            expected: None,
            threshold: config.drift_min_slope_ratio,
            score: (slope_ratio.abs() / 0.05).min(1.0),
        },
        format!(
            "{} {} {:.1}% per hour without leak-grade fit (R² {:.2})",
            ctx.series.metric,
            word,
            slope_ratio.abs() * 100.0,
            trend.r_squared
        ),
    ))
}

/// Sustained proximity to the configured limit over the recent window
fn saturation_rule(
    config: &DetectorConfig,
    ctx: &EvaluationContext<'_>,
    _baseline: Option<&BaselineStats>,
) -> Option<Finding> {
    let limit = ctx.limit.filter(|l| *l > f64::EPSILON)?;
    if ctx.series.len() < config.saturation_min_samples {
        return None;
    }

    // p95 over the window ignores single excursions; high p95 means the
    // series is living near the limit, not visiting it
    let utilization = stats::percentile(&ctx.series.values(), 95.0) / limit;
    if utilization < config.saturation_ratio {
        return None;
    }

    let severity = if utilization >= 0.99 {
        Severity::Critical
    } else if utilization >= 0.95 {
        Severity::High
    } else {
        Severity::Medium
    };

    Some(Finding::new(
        ctx.series.key.clone(),
        ctx.series.metric,
        PatternKind::Saturation,
        severity,
        Evidence {
            rule: "saturation".to_string(),
            observed: utilization,
            expected: None,
            threshold: config.saturation_ratio,
            score: utilization.min(1.0),
        },
        format!(
            "{} p95 at {:.0}% of the configured limit {:.2}",
            ctx.series.metric,
            utilization * 100.0,
            limit
        ),
    ))
}
