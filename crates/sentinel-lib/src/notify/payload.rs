//! Payload rendering for the supported webhook channels
//!
//! Each channel gets the shape its product expects: Slack Block Kit, Teams
//! MessageCard, Discord embeds, or a plain JSON envelope for generic
//! receivers. Rendering is infallible; every alert field is optional-safe.

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::models::{Alert, Severity};

use super::ChannelKind;

type HmacSha256 = Hmac<Sha256>;

/// Hex color for formats that take a CSS-style string
pub fn severity_color_hex(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#FF0000",
        Severity::High => "#FF6600",
        Severity::Medium => "#FFCC00",
        Severity::Low => "#00CC00",
    }
}

/// Decimal color for Discord embeds
pub fn severity_color_int(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 16711680,
        Severity::High => 16737280,
        Severity::Medium => 16763904,
        Severity::Low => 52224,
    }
}

/// Render an alert into the payload shape for the given channel
pub fn render_payload(kind: ChannelKind, alert: &Alert) -> Value {
    match kind {
        ChannelKind::Slack => render_slack(alert),
        ChannelKind::Teams => render_teams(alert),
        ChannelKind::Discord => render_discord(alert),
        ChannelKind::Generic => render_generic(alert),
    }
}

/// HMAC-SHA256 signature over the serialized body, `sha256=<hex>` form
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn fact_pairs(alert: &Alert) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(ref key) = alert.workload {
        pairs.push(("Workload".to_string(), key.to_string()));
    }
    if let Some(metric) = alert.metric {
        pairs.push(("Metric".to_string(), metric.to_string()));
    }
    if let Some(pattern) = alert.pattern {
        pairs.push(("Pattern".to_string(), pattern.to_string()));
    }
    for (name, value) in &alert.facts {
        pairs.push((name.clone(), value.clone()));
    }
    pairs
}

fn render_slack(alert: &Alert) -> Value {
    let fields: Vec<Value> = fact_pairs(alert)
        .into_iter()
        .map(|(name, value)| {
            json!({ "type": "mrkdwn", "text": format!("*{}:*\n{}", name, value) })
        })
        .collect();

    let mut blocks = vec![json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": format!("🚨 {} - {}", alert.severity.to_string().to_uppercase(), alert.title),
        }
    })];
    if !fields.is_empty() {
        blocks.push(json!({ "type": "section", "fields": fields }));
    }
    blocks.push(json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": format!("*Description:*\n{}", alert.body) }
    }));
    blocks.push(json!({
        "type": "context",
        "elements": [
            { "type": "mrkdwn", "text": format!("Raised at: {}", alert.raised_at.format("%Y-%m-%d %H:%M:%S UTC")) }
        ]
    }));

    json!({ "blocks": blocks })
}

fn render_teams(alert: &Alert) -> Value {
    let facts: Vec<Value> = std::iter::once((
        "Severity".to_string(),
        alert.severity.to_string().to_uppercase(),
    ))
    .chain(fact_pairs(alert))
    .map(|(name, value)| json!({ "name": name, "value": value }))
    .collect();

    let subtitle = alert
        .workload
        .as_ref()
        .map(|key| key.to_string())
        .unwrap_or_else(|| "workload-sentinel".to_string());

    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        // Teams wants the theme color without the leading '#'
        "themeColor": severity_color_hex(alert.severity).trim_start_matches('#'),
        "summary": format!("{} - {}", alert.severity.to_string().to_uppercase(), alert.title),
        "sections": [{
            "activityTitle": format!("🚨 {}", alert.title),
            "activitySubtitle": subtitle,
            "facts": facts,
            "text": alert.body,
        }]
    })
}

fn render_discord(alert: &Alert) -> Value {
    let fields: Vec<Value> = fact_pairs(alert)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value, "inline": true }))
        .collect();

    json!({
        "embeds": [{
            "title": format!("🚨 {}", alert.title),
            "description": alert.body,
            "color": severity_color_int(alert.severity),
            "fields": fields,
            "timestamp": alert.raised_at.to_rfc3339(),
        }]
    })
}

fn render_generic(alert: &Alert) -> Value {
    json!({
        "event": "workload_alert",
        "alert": alert,
    })
}
