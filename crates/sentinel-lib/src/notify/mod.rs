//! Alert notification over outbound webhooks
//!
//! Handles:
//! - Webhook registry with per-channel payload formats
//! - Severity filtering per webhook
//! - Delivery with retry, backoff, and a persisted attempt trail

pub mod dispatcher;
pub mod payload;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{generate_id, Severity};

pub use dispatcher::{
    DeliveryError, DispatchConfig, HttpTransport, NotificationDispatcher, WebhookRequest,
    WebhookResponse, WebhookTransport,
};
pub use payload::{render_payload, sign_payload};

/// Payload dialect spoken by a webhook endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Slack,
    Teams,
    Discord,
    /// Plain JSON envelope for anything that is not a chat product
    Generic,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Slack => write!(f, "slack"),
            ChannelKind::Teams => write!(f, "teams"),
            ChannelKind::Discord => write!(f, "discord"),
            ChannelKind::Generic => write!(f, "generic"),
        }
    }
}

/// Minimum severity a webhook wants to hear about
///
/// `Mute` sits above `Critical`: the webhook stays registered but accepts
/// nothing, which is how an endpoint is silenced without deleting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityFilter {
    Low,
    Medium,
    High,
    Critical,
    Mute,
}

impl SeverityFilter {
    /// Whether an alert of the given severity passes this filter
    pub fn accepts(&self, severity: Severity) -> bool {
        let floor = match self {
            SeverityFilter::Low => Severity::Low,
            SeverityFilter::Medium => Severity::Medium,
            SeverityFilter::High => Severity::High,
            SeverityFilter::Critical => Severity::Critical,
            SeverityFilter::Mute => return false,
        };
        severity >= floor
    }
}

impl Default for SeverityFilter {
    fn default() -> Self {
        SeverityFilter::Low
    }
}

/// A registered webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Stable identifier, generated at registration
    pub id: String,
    /// Operator-facing name
    pub name: String,
    /// Payload format to render
    pub kind: ChannelKind,
    /// Destination URL
    pub url: String,
    /// Minimum severity forwarded to this endpoint
    #[serde(default)]
    pub filter: SeverityFilter,
    /// Disabled webhooks keep their config but receive nothing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra headers sent with every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// When set, payloads are signed and the signature header attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl WebhookConfig {
    pub fn new(name: impl Into<String>, kind: ChannelKind, url: impl Into<String>) -> Self {
        Self {
            id: generate_id("whk"),
            name: name.into(),
            kind,
            url: url.into(),
            filter: SeverityFilter::default(),
            enabled: true,
            headers: HashMap::new(),
            secret: None,
        }
    }

    pub fn with_filter(mut self, filter: SeverityFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Whether an alert of this severity should be delivered here
    pub fn wants(&self, severity: Severity) -> bool {
        self.enabled && self.filter.accepts(severity)
    }
}

/// Terminal state of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    /// Recorded before the request is made; overwritten on completion
    Pending,
    Success,
    Failed,
}

/// One row in the delivery trail for an alert/webhook pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub webhook_id: String,
    pub alert_id: String,
    /// 1-based attempt counter
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    pub attempted_at: DateTime<Utc>,
    /// Set on non-terminal failures; `None` once retries are exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// HTTP status when a response was received at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryAttempt {
    pub fn pending(webhook_id: &str, alert_id: &str, attempt: u32) -> Self {
        Self {
            webhook_id: webhook_id.to_string(),
            alert_id: alert_id.to_string(),
            attempt,
            outcome: DeliveryOutcome::Pending,
            attempted_at: Utc::now(),
            next_retry_at: None,
            response_status: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_at_and_above_floor() {
        assert!(SeverityFilter::Low.accepts(Severity::Low));
        assert!(SeverityFilter::Low.accepts(Severity::Critical));
        assert!(!SeverityFilter::High.accepts(Severity::Medium));
        assert!(SeverityFilter::High.accepts(Severity::High));
        assert!(SeverityFilter::Critical.accepts(Severity::Critical));
        assert!(!SeverityFilter::Critical.accepts(Severity::High));
    }

    #[test]
    fn test_mute_accepts_nothing() {
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert!(!SeverityFilter::Mute.accepts(severity));
        }
    }

    #[test]
    fn test_disabled_webhook_wants_nothing() {
        let mut config = WebhookConfig::new("ops", ChannelKind::Slack, "https://example.test/hook");
        assert!(config.wants(Severity::Low));
        config.enabled = false;
        assert!(!config.wants(Severity::Critical));
    }

    #[test]
    fn test_webhook_ids_are_unique() {
        let a = WebhookConfig::new("a", ChannelKind::Generic, "https://example.test/a");
        let b = WebhookConfig::new("b", ChannelKind::Generic, "https://example.test/b");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("whk-"));
    }

    #[test]
    fn test_filter_serde_round_trip() {
        let json = serde_json::to_string(&SeverityFilter::Mute).unwrap();
        assert_eq!(json, "\"mute\"");
        let back: SeverityFilter = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(back, SeverityFilter::High);
    }
}
