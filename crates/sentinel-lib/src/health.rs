//! Component health tracking
//!
//! Every long-lived engine component reports here; the API serves the
//! rollup as liveness and readiness probes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Impaired but still doing useful work
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// One component's reported health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered its current status
    pub since: DateTime<Utc>,
    /// When the component last reported
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn report(status: ComponentStatus, message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            message,
            since: now,
            checked_at: now,
        }
    }

    pub fn healthy() -> Self {
        Self::report(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Rollup served by the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst component wins: one unhealthy component fails the rollup
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Rollup served by the readiness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const METRICS_SOURCE: &str = "metrics_source";
    pub const MONITOR_SUPERVISOR: &str = "monitor_supervisor";
    pub const NOTIFICATION_DISPATCHER: &str = "notification_dispatcher";
    pub const SCHEDULE_RUNNER: &str = "schedule_runner";
}

/// Shared registry every engine component reports into
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Record a report, keeping `since` when the status did not change
    pub async fn update(&self, name: &str, mut health: ComponentHealth) {
        let mut components = self.components.write().await;
        if let Some(previous) = components.get(name) {
            if previous.status == health.status {
                health.since = previous.since;
            }
        }
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Flip once startup wiring is complete
    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Engine still starting".to_string()),
            };
        }

        let health = self.health().await;
        if health.status == ComponentStatus::Unhealthy {
            let mut failed: Vec<&str> = health
                .components
                .iter()
                .filter(|(_, component)| component.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| name.as_str())
                .collect();
            failed.sort_unstable();
            return ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", failed.join(", "))),
            };
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}
