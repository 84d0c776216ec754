//! Workload Sentinel - workload health monitoring and automation engine
//!
//! Watches workload metric series for anomalous patterns, pushes alerts to
//! registered webhook channels and drives recurring automation runs on cron
//! schedules. State is managed over an HTTP API.

use anyhow::Result;
use sentinel_lib::{
    health::{components, HealthRegistry},
    monitor::{MonitorConfig, MonitorSupervisor},
    notify::{DispatchConfig, HttpTransport, NotificationDispatcher},
    observability::{EngineMetrics, StructuredLogger},
    schedule::{ScheduleConfig, ScheduleRunner},
    source::{MetricsSource, PrometheusConfig, PrometheusSource, StaticSource},
    store::MemoryStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod runs;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting workload-sentinel");

    // Load configuration
    let config = config::SentinelConfig::load()?;
    info!(instance = %config.instance, source = ?config.source, "Engine configured");

    // Initialize health registry
    let health = HealthRegistry::new();
    health.register(components::METRICS_SOURCE).await;
    health.register(components::MONITOR_SUPERVISOR).await;
    health.register(components::NOTIFICATION_DISPATCHER).await;
    health.register(components::SCHEDULE_RUNNER).await;

    // Initialize metrics
    let metrics = EngineMetrics::new();
    metrics.set_monitors_active(0);
    metrics.set_schedules_paused(0);

    // Initialize structured logger
    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(ENGINE_VERSION);

    let store = Arc::new(MemoryStore::new());

    let dispatch_config = DispatchConfig::default();
    let transport = Arc::new(HttpTransport::new(dispatch_config.request_timeout)?);
    let dispatcher = Arc::new(NotificationDispatcher::new(
        dispatch_config,
        transport,
        store.clone(),
        StructuredLogger::new(&config.instance),
    ));

    let source: Arc<dyn MetricsSource> = match config.source {
        config::SourceMode::Prometheus => Arc::new(PrometheusSource::new(PrometheusConfig {
            base_url: config.prometheus_url.clone(),
            timeout: Duration::from_secs(config.prometheus_timeout_secs),
        })?),
        config::SourceMode::Static => Arc::new(StaticSource::new()),
    };

    let supervisor = Arc::new(MonitorSupervisor::new(
        MonitorConfig {
            cooldown: Duration::from_secs(config.cooldown_secs),
            ..MonitorConfig::default()
        },
        source.clone(),
        dispatcher.clone(),
        store.clone(),
        StructuredLogger::new(&config.instance),
    ));

    let handler = Arc::new(runs::EngineRunHandler::new(
        supervisor.clone(),
        source,
        dispatcher.clone(),
        store.clone(),
    ));
    let runner = Arc::new(ScheduleRunner::new(
        ScheduleConfig {
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            ..ScheduleConfig::default()
        },
        handler,
        dispatcher.clone(),
        store.clone(),
        StructuredLogger::new(&config.instance),
    ));

    // Create shared application state
    let app_state = Arc::new(api::AppState {
        health: health.clone(),
        supervisor: supervisor.clone(),
        runner: runner.clone(),
        dispatcher: dispatcher.clone(),
        store,
    });

    // Start the engine loops and the API server
    let (shutdown_tx, _) = broadcast::channel(4);
    let supervisor_task = tokio::spawn(supervisor.clone().run(shutdown_tx.subscribe()));
    let runner_task = tokio::spawn(runner.clone().run(shutdown_tx.subscribe()));
    let api_task = tokio::spawn(api::serve(config.api_port, app_state));

    // Mark engine as ready after initialization
    health.set_ready(true).await;
    info!(port = config.api_port, "Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    dispatcher.shutdown();
    let _ = supervisor_task.await;
    let _ = runner_task.await;
    api_task.abort();
    info!("Shutting down");

    Ok(())
}
