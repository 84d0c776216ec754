//! Statistical analysis of workload metric series
//!
//! Three layers: `stats` holds the numeric primitives, `trend` fits and
//! classifies a series over time, `detector` turns series plus context
//! into findings.

pub mod detector;
pub mod stats;
pub mod trend;

pub use detector::{health_score, AnomalyDetector, DetectorConfig, EvaluationContext};
pub use stats::BaselineStats;
pub use trend::{TrendAnalyzer, TrendConfig, TrendDirection, TrendResult};
