//! Engine configuration
//!
//! Settings come from an optional `sentinel` config file overlaid with
//! `SENTINEL_*` environment variables. Anything unset falls back to the
//! defaults below.

use anyhow::Result;
use serde::Deserialize;

/// Which backend serves metric queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Query a Prometheus-compatible HTTP API
    Prometheus,
    /// In-memory fixtures, for local runs without a metrics backend
    Static,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Instance name carried on every structured log line
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port for the health, metrics and management API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Metric source backend
    #[serde(default = "default_source")]
    pub source: SourceMode,

    /// Prometheus endpoint, used when the source is `prometheus`
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Prometheus query timeout in seconds
    #[serde(default = "default_prometheus_timeout_secs")]
    pub prometheus_timeout_secs: u64,

    /// Suppression window for repeat findings, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// How often the schedule runner checks for due schedules, in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Hard cap on a single scheduled run, in seconds
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "workload-sentinel".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_source() -> SourceMode {
    SourceMode::Prometheus
}

fn default_prometheus_url() -> String {
    "http://prometheus:9090".to_string()
}

fn default_prometheus_timeout_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    300
}

impl SentinelConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("sentinel").required(false))
            .add_source(config::Environment::with_prefix("SENTINEL"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| SentinelConfig {
            instance: default_instance(),
            api_port: default_api_port(),
            source: default_source(),
            prometheus_url: default_prometheus_url(),
            prometheus_timeout_secs: default_prometheus_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            run_timeout_secs: default_run_timeout_secs(),
        }))
    }
}
