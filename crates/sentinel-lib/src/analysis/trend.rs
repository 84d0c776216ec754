//! Trend analysis over sample series
//!
//! Fits an OLS regression over (hours since first sample, value), scores the
//! fit, and probes for hourly/daily seasonality via autocorrelation of the
//! detrended series. Always returns a result; series below the minimum
//! sample count yield a zeroed result with confidence 0.

use crate::analysis::stats::{self, Regression};
use crate::models::SampleSeries;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Tuning knobs for trend analysis; defaults match the shipped policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Below this, no analysis is attempted at all
    pub min_samples: usize,
    /// Below this, a trend is computed but confidence stays 0
    pub confidence_floor_samples: usize,
    /// Sample count treated as fully trustworthy
    pub high_confidence_samples: usize,
    /// Minimum autocorrelation for a seasonality claim
    pub seasonality_min_correlation: f64,
    /// Std dev above this fraction of the mean marks the series volatile
    pub volatility_ratio: f64,
    /// Confidence multiplier applied to volatile series
    pub volatility_penalty: f64,
    /// Normalized slope per day below which the series counts as stable
    pub direction_threshold_per_day: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            confidence_floor_samples: 10,
            high_confidence_samples: 100,
            seasonality_min_correlation: 0.5,
            volatility_ratio: 0.5,
            volatility_penalty: 0.7,
            direction_threshold_per_day: 0.01,
        }
    }
}

/// Coarse direction classification of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    Volatile,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
            TrendDirection::Volatile => "volatile",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regression and seasonality summary for one evaluated series.
///
/// Recomputed on every evaluation, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    /// Fitted slope in value units per hour
    pub slope_per_hour: f64,
    /// Fitted value at the first sample's timestamp
    pub intercept: f64,
    pub r_squared: f64,
    /// Strongest qualifying seasonal period, if any
    pub seasonality: Option<Duration>,
    /// 0.0..=1.0, scaled by sample count and volatility
    pub confidence: f64,
    pub direction: TrendDirection,
    pub mean: f64,
    pub std_dev: f64,
    /// Hours between first and last sample
    pub span_hours: f64,
    pub samples: usize,
}

impl TrendResult {
    fn insufficient(samples: usize) -> Self {
        Self {
            slope_per_hour: 0.0,
            intercept: 0.0,
            r_squared: 0.0,
            seasonality: None,
            confidence: 0.0,
            direction: TrendDirection::Stable,
            mean: 0.0,
            std_dev: 0.0,
            span_hours: 0.0,
            samples,
        }
    }
}

/// Computes trend summaries from sample series
#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Analyze one series. Never fails; degenerate input degrades confidence.
    pub fn analyze(&self, series: &SampleSeries) -> TrendResult {
        let n = series.len();
        if n < self.config.min_samples {
            return TrendResult::insufficient(n);
        }

        // Hours from the first sample keeps x small and the slope readable
        let t0 = series.points[0].timestamp;
        let points: Vec<(f64, f64)> = series
            .points
            .iter()
            .map(|p| {
                let hours =
                    (p.timestamp - t0).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_HOUR;
                (hours, p.value)
            })
            .collect();

        let regression = stats::linear_regression(&points);
        let values = series.values();
        let mean = stats::mean(&values);
        let std_dev = stats::std_dev(&values);
        let span_hours = points.last().map(|(x, _)| *x).unwrap_or(0.0);

        let volatile =
            mean.abs() > f64::EPSILON && std_dev > self.config.volatility_ratio * mean.abs();
        let direction = self.classify_direction(&regression, mean, volatile);
        let seasonality = self.detect_seasonality(series, &points, &regression);
        let confidence = self.confidence(n, volatile);

        TrendResult {
            slope_per_hour: regression.slope,
            intercept: regression.intercept,
            r_squared: regression.r_squared,
            seasonality,
            confidence,
            direction,
            mean,
            std_dev,
            span_hours,
            samples: n,
        }
    }

    /// Project the fitted line `horizon` past the last sample, clamped at zero
    pub fn project(&self, trend: &TrendResult, horizon: Duration) -> f64 {
        let hours = trend.span_hours + horizon.as_secs_f64() / SECONDS_PER_HOUR;
        (trend.intercept + trend.slope_per_hour * hours).max(0.0)
    }

    fn confidence(&self, samples: usize, volatile: bool) -> f64 {
        if samples < self.config.confidence_floor_samples {
            return 0.0;
        }
        let base = (samples as f64 / self.config.high_confidence_samples as f64).min(1.0);
        if volatile {
            base * self.config.volatility_penalty
        } else {
            base
        }
    }

    fn classify_direction(
        &self,
        regression: &Regression,
        mean: f64,
        volatile: bool,
    ) -> TrendDirection {
        if volatile {
            return TrendDirection::Volatile;
        }
        if mean.abs() < f64::EPSILON {
            return TrendDirection::Stable;
        }
        let normalized_per_day = regression.slope * 24.0 / mean.abs();
        if normalized_per_day > self.config.direction_threshold_per_day {
            TrendDirection::Increasing
        } else if normalized_per_day < -self.config.direction_threshold_per_day {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }

    /// Autocorrelation probe at hourly and daily lags on detrended values.
    ///
    /// A candidate period needs its lag to be at least 2 samples, a window
    /// holding at least 2 full cycles, and correlation above the configured
    /// minimum. The strongest qualifying candidate wins.
    fn detect_seasonality(
        &self,
        series: &SampleSeries,
        points: &[(f64, f64)],
        regression: &Regression,
    ) -> Option<Duration> {
        let n = series.len();
        if n < 4 {
            return None;
        }
        let span_seconds = series.span_seconds();
        if span_seconds <= 0.0 {
            return None;
        }
        let step_seconds = span_seconds / (n - 1) as f64;
        if step_seconds <= 0.0 {
            return None;
        }

        // A steady climb correlates with itself at every lag; remove the
        // fitted line first so only the cyclic component is scored.
        let residuals: Vec<f64> = points
            .iter()
            .map(|(x, y)| y - (regression.intercept + regression.slope * x))
            .collect();

        let mut best: Option<(f64, u64)> = None;
        for period_seconds in [3600u64, 86400u64] {
            let lag = (period_seconds as f64 / step_seconds).round() as usize;
            if lag < 2 || n < 2 * lag {
                continue;
            }
            let correlation = stats::autocorrelation(&residuals, lag);
            if correlation < self.config.seasonality_min_correlation {
                continue;
            }
            match best {
                Some((best_corr, _)) if best_corr >= correlation => {}
                _ => best = Some((correlation, period_seconds)),
            }
        }

        best.map(|(_, period)| Duration::from_secs(period))
    }
}
