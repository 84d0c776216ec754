//! Statistical primitives shared by the trend analyzer and detection rules
//!
//! All functions are total: degenerate inputs (empty slices, zero variance,
//! zero lag room) return zeros instead of NaN or panics.

/// Arithmetic mean, 0.0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (Bessel-corrected), 0.0 below 2 samples
pub fn std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}

/// Percentile by linear interpolation between closest ranks.
///
/// `p` in 0..=100. Sorts a copy internally; 0.0 for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// (Q1, Q3) via interpolated percentiles
pub fn quartiles(values: &[f64]) -> (f64, f64) {
    (percentile(values, 25.0), percentile(values, 75.0))
}

/// Standard score of `value` against a baseline; 0.0 when the baseline has no spread
pub fn z_score(value: f64, baseline_mean: f64, baseline_std_dev: f64) -> f64 {
    if baseline_std_dev.abs() < f64::EPSILON {
        return 0.0;
    }
    (value - baseline_mean) / baseline_std_dev
}

/// Ordinary least-squares fit over (x, y) points
#[derive(Debug, Clone, Copy, Default)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

/// OLS regression; zeros below 2 points or when x has no spread.
///
/// R² is reported as 0.0 for a zero-variance y (a flat series carries no
/// fit information the callers should act on).
pub fn linear_regression(points: &[(f64, f64)]) -> Regression {
    let n = points.len() as f64;
    if n < 2.0 {
        return Regression::default();
    }

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (x, y) in points {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return Regression::default();
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;

    let mean_y = sum_y / n;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in points {
        let predicted = slope * x + intercept;
        ss_res += (y - predicted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    let r_squared = if ss_tot.abs() < f64::EPSILON {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    };

    Regression {
        slope,
        intercept,
        r_squared,
    }
}

/// Pearson correlation between two equal-length slices; 0.0 when degenerate
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator < f64::EPSILON {
        return 0.0;
    }
    cov / denominator
}

/// Autocorrelation of a series with itself shifted by `lag` samples
pub fn autocorrelation(values: &[f64], lag: usize) -> f64 {
    if lag == 0 {
        return 1.0;
    }
    if values.len() < lag + 2 {
        return 0.0;
    }
    pearson(&values[..values.len() - lag], &values[lag..])
}

/// Summary statistics of a baseline window used as the anomaly reference
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
    pub p95: f64,
    pub count: usize,
}

impl BaselineStats {
    /// None for an empty window
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (q1, q3) = quartiles(values);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            mean: mean(values),
            std_dev: std_dev(values),
            min,
            max,
            q1,
            q3,
            p95: percentile(values, 95.0),
            count: values.len(),
        })
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }

    pub fn z_score(&self, value: f64) -> f64 {
        z_score(value, self.mean, self.std_dev)
    }
}
