//! Engine library for workload health monitoring
//!
//! This crate provides the core functionality for:
//! - Metric series retrieval from Prometheus-compatible sources
//! - Statistical trend analysis and anomaly detection
//! - Monitor lifecycle supervision
//! - Webhook notification dispatch with retries
//! - Cron-driven automation runs
//! - Health checks and observability

pub mod analysis;
pub mod health;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod schedule;
pub mod source;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
