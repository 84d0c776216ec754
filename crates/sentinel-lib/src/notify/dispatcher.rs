//! Webhook dispatch with retry and exponential backoff
//!
//! Deliveries run as detached tasks so a slow endpoint never blocks the
//! evaluation path. Every attempt is recorded through the store before the
//! request is made and updated with its outcome, so the trail reads
//! pending -> failed -> ... -> success/failed even if the process dies
//! mid-retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::models::Alert;
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::store::RecordStore;

use super::payload::{render_payload, sign_payload};
use super::{DeliveryAttempt, DeliveryOutcome, WebhookConfig};

/// Header carrying the HMAC signature when a webhook has a secret
pub const SIGNATURE_HEADER: &str = "X-Sentinel-Signature";

/// Delivery and retry policy
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per webhook before a delivery is abandoned
    pub max_attempts: u32,
    /// Delay after the first failure; doubles each retry
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Per-request timeout for the HTTP transport
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    /// Backoff before the retry that follows `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }
}

/// Why a single delivery attempt failed
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// What came back from the endpoint
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    /// Present on 429 responses; overrides the computed backoff
    pub retry_after: Option<Duration>,
}

/// A fully rendered request, built once and reused across retries
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Transport seam so tests can fail deliveries without a network
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError>;
}

/// Production transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("workload-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError> {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = if status == 429 {
            // Rate-limited endpoints tell us when to come back; default 60s
            response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .or(Some(Duration::from_secs(60)))
        } else {
            None
        };

        Ok(WebhookResponse { status, retry_after })
    }
}

/// Central alert fan-out over the registered webhooks
pub struct NotificationDispatcher {
    config: DispatchConfig,
    transport: Arc<dyn WebhookTransport>,
    store: Arc<dyn RecordStore>,
    webhooks: RwLock<Vec<WebhookConfig>>,
    shutdown: broadcast::Sender<()>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl NotificationDispatcher {
    pub fn new(
        config: DispatchConfig,
        transport: Arc<dyn WebhookTransport>,
        store: Arc<dyn RecordStore>,
        logger: StructuredLogger,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        Self {
            config,
            transport,
            store,
            webhooks: RwLock::new(Vec::new()),
            shutdown,
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    /// Add a webhook to the registry; returns the stored config
    pub async fn register(&self, webhook: WebhookConfig) -> WebhookConfig {
        let mut webhooks = self.webhooks.write().await;
        webhooks.push(webhook.clone());
        webhook
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut webhooks = self.webhooks.write().await;
        let before = webhooks.len();
        webhooks.retain(|w| w.id != id);
        webhooks.len() != before
    }

    pub async fn get(&self, id: &str) -> Option<WebhookConfig> {
        self.webhooks.read().await.iter().find(|w| w.id == id).cloned()
    }

    pub async fn list(&self) -> Vec<WebhookConfig> {
        self.webhooks.read().await.clone()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut webhooks = self.webhooks.write().await;
        match webhooks.iter_mut().find(|w| w.id == id) {
            Some(webhook) => {
                webhook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Fan an alert out to every registered webhook that wants it
    pub async fn publish(self: &Arc<Self>, alert: Alert) -> usize {
        let targets = self.list().await;
        self.dispatch(&alert, &targets).await
    }

    /// Schedule deliveries to the given targets; returns how many were spawned
    pub async fn dispatch(self: &Arc<Self>, alert: &Alert, targets: &[WebhookConfig]) -> usize {
        let mut scheduled = 0;
        for webhook in targets {
            if !webhook.wants(alert.severity) {
                debug!(
                    webhook = %webhook.name,
                    alert_id = %alert.id,
                    severity = %alert.severity,
                    "webhook filtered out"
                );
                continue;
            }

            let request = self.build_request(webhook, alert);
            let task = Arc::clone(self);
            let webhook_id = webhook.id.clone();
            let alert_id = alert.id.clone();
            tokio::spawn(async move {
                task.deliver_with_retry(webhook_id, alert_id, request).await;
            });
            scheduled += 1;
        }
        scheduled
    }

    /// Stop in-flight retry loops at their next sleep
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn build_request(&self, webhook: &WebhookConfig, alert: &Alert) -> WebhookRequest {
        let body = render_payload(webhook.kind, alert).to_string();

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        for (name, value) in &webhook.headers {
            headers.push((name.clone(), value.clone()));
        }
        if let Some(ref secret) = webhook.secret {
            headers.push((SIGNATURE_HEADER.to_string(), sign_payload(secret, &body)));
        }

        WebhookRequest {
            url: webhook.url.clone(),
            headers,
            body,
        }
    }

    async fn deliver_with_retry(
        self: Arc<Self>,
        webhook_id: String,
        alert_id: String,
        request: WebhookRequest,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();

        for attempt in 1..=self.config.max_attempts {
            let mut record = DeliveryAttempt::pending(&webhook_id, &alert_id, attempt);
            if let Err(error) = self.store.record_delivery(record.clone()).await {
                warn!(%error, "failed to record pending delivery");
            }
            self.metrics.inc_delivery_attempts();

            let started = std::time::Instant::now();
            let result = self.transport.deliver(&request).await;
            self.metrics.observe_delivery_latency(started.elapsed().as_secs_f64());

            match result {
                Ok(response) if (200..300).contains(&response.status) => {
                    record.outcome = DeliveryOutcome::Success;
                    record.response_status = Some(response.status);
                    if let Err(error) = self.store.record_delivery(record).await {
                        warn!(%error, "failed to record delivery result");
                    }
                    debug!(
                        webhook_id = %webhook_id,
                        alert_id = %alert_id,
                        attempt,
                        "webhook delivered"
                    );
                    return;
                }
                other => {
                    let (status, error_text, retry_after) = match other {
                        Ok(response) => (
                            Some(response.status),
                            format!("endpoint returned status {}", response.status),
                            response.retry_after,
                        ),
                        Err(error) => (None, error.to_string(), None),
                    };

                    record.outcome = DeliveryOutcome::Failed;
                    record.response_status = status;
                    record.error = Some(error_text.clone());
                    self.metrics.inc_delivery_failures();

                    if attempt == self.config.max_attempts {
                        record.next_retry_at = None;
                        if let Err(error) = self.store.record_delivery(record).await {
                            warn!(%error, "failed to record delivery result");
                        }
                        self.metrics.inc_deliveries_exhausted();
                        self.logger.log_delivery_exhausted(&webhook_id, &alert_id, attempt);
                        return;
                    }

                    let delay = retry_after.unwrap_or_else(|| self.config.backoff_delay(attempt));
                    record.next_retry_at =
                        Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                    if let Err(error) = self.store.record_delivery(record).await {
                        warn!(%error, "failed to record delivery result");
                    }
                    warn!(
                        webhook_id = %webhook_id,
                        alert_id = %alert_id,
                        attempt,
                        error = %error_text,
                        retry_in_secs = delay.as_secs(),
                        "webhook delivery failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            debug!(webhook_id = %webhook_id, "retry abandoned on shutdown");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use crate::notify::{ChannelKind, SeverityFilter};
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockTransport {
        responses: Mutex<VecDeque<Result<WebhookResponse, DeliveryError>>>,
        calls: AtomicUsize,
    }

    impl MockTransport {
        fn new(responses: Vec<Result<WebhookResponse, DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok(status: u16) -> Result<WebhookResponse, DeliveryError> {
            Ok(WebhookResponse {
                status,
                retry_after: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookTransport for MockTransport {
        async fn deliver(
            &self,
            _request: &WebhookRequest,
        ) -> Result<WebhookResponse, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::ok(200))
        }
    }

    fn dispatcher(
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
    ) -> Arc<NotificationDispatcher> {
        Arc::new(NotificationDispatcher::new(
            DispatchConfig::default(),
            transport,
            store,
            StructuredLogger::new("test"),
        ))
    }

    fn alert(severity: Severity) -> Alert {
        Alert::operational(severity, "test alert", "something happened")
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = DispatchConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(6), Duration::from_secs(32));
        assert_eq!(config.backoff_delay(7), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_success_records_single_attempt() {
        let transport = MockTransport::new(vec![MockTransport::ok(200)]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store.clone());

        dispatcher
            .clone()
            .deliver_with_retry(
                "whk-1".to_string(),
                "alrt-1".to_string(),
                WebhookRequest {
                    url: "https://example.test/hook".to_string(),
                    headers: vec![],
                    body: "{}".to_string(),
                },
            )
            .await;

        assert_eq!(transport.calls(), 1);
        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, DeliveryOutcome::Success);
        assert_eq!(log[0].response_status, Some(200));
        assert!(log[0].next_retry_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_lineage_until_success() {
        let transport = MockTransport::new(vec![
            MockTransport::ok(500),
            MockTransport::ok(503),
            MockTransport::ok(204),
        ]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store.clone());

        let started = tokio::time::Instant::now();
        dispatcher
            .clone()
            .deliver_with_retry(
                "whk-1".to_string(),
                "alrt-1".to_string(),
                WebhookRequest {
                    url: "https://example.test/hook".to_string(),
                    headers: vec![],
                    body: "{}".to_string(),
                },
            )
            .await;

        // Backoff slept 1s then 2s in virtual time
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(transport.calls(), 3);

        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].outcome, DeliveryOutcome::Failed);
        assert_eq!(log[0].response_status, Some(500));
        assert!(log[0].next_retry_at.is_some());
        assert_eq!(log[1].outcome, DeliveryOutcome::Failed);
        assert_eq!(log[2].outcome, DeliveryOutcome::Success);
        assert_eq!(log[2].response_status, Some(204));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let transport = MockTransport::new(vec![
            MockTransport::ok(500),
            MockTransport::ok(500),
            MockTransport::ok(500),
            MockTransport::ok(500),
            MockTransport::ok(500),
        ]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store.clone());

        let started = tokio::time::Instant::now();
        dispatcher
            .clone()
            .deliver_with_retry(
                "whk-1".to_string(),
                "alrt-1".to_string(),
                WebhookRequest {
                    url: "https://example.test/hook".to_string(),
                    headers: vec![],
                    body: "{}".to_string(),
                },
            )
            .await;

        // Four sleeps between five attempts: 1 + 2 + 4 + 8
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(transport.calls(), 5);

        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 5);
        let last = log.last().unwrap();
        assert_eq!(last.outcome, DeliveryOutcome::Failed);
        assert!(last.next_retry_at.is_none(), "terminal failure has no retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let transport = MockTransport::new(vec![
            Ok(WebhookResponse {
                status: 429,
                retry_after: Some(Duration::from_secs(5)),
            }),
            MockTransport::ok(200),
        ]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store.clone());

        let started = tokio::time::Instant::now();
        dispatcher
            .clone()
            .deliver_with_retry(
                "whk-1".to_string(),
                "alrt-1".to_string(),
                WebhookRequest {
                    url: "https://example.test/hook".to_string(),
                    headers: vec![],
                    body: "{}".to_string(),
                },
            )
            .await;

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let transport =
            MockTransport::new(vec![Err(DeliveryError::Timeout), MockTransport::ok(200)]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store.clone());

        dispatcher
            .clone()
            .deliver_with_retry(
                "whk-1".to_string(),
                "alrt-1".to_string(),
                WebhookRequest {
                    url: "https://example.test/hook".to_string(),
                    headers: vec![],
                    body: "{}".to_string(),
                },
            )
            .await;

        let log = store.delivery_log("alrt-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].error.as_deref().unwrap().contains("timed out"));
        assert!(log[0].response_status.is_none());
        assert_eq!(log[1].outcome, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn test_dispatch_respects_filter_and_enabled() {
        let transport = MockTransport::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport, store);

        let accepts = WebhookConfig::new("ops", ChannelKind::Slack, "https://example.test/a")
            .with_filter(SeverityFilter::High);
        let muted = WebhookConfig::new("muted", ChannelKind::Slack, "https://example.test/b")
            .with_filter(SeverityFilter::Mute);
        let mut disabled = WebhookConfig::new("off", ChannelKind::Slack, "https://example.test/c");
        disabled.enabled = false;
        let targets = vec![accepts, muted, disabled];

        assert_eq!(dispatcher.dispatch(&alert(Severity::Critical), &targets).await, 1);
        assert_eq!(dispatcher.dispatch(&alert(Severity::Medium), &targets).await, 0);
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let transport = MockTransport::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport, store);

        let registered = dispatcher
            .register(WebhookConfig::new(
                "ops",
                ChannelKind::Teams,
                "https://example.test/hook",
            ))
            .await;

        assert_eq!(dispatcher.list().await.len(), 1);
        assert!(dispatcher.get(&registered.id).await.is_some());

        assert!(dispatcher.set_enabled(&registered.id, false).await);
        assert!(!dispatcher.get(&registered.id).await.unwrap().enabled);

        assert!(dispatcher.remove(&registered.id).await);
        assert!(dispatcher.list().await.is_empty());
        assert!(!dispatcher.remove(&registered.id).await);
    }

    #[tokio::test]
    async fn test_signed_request_carries_signature_header() {
        let transport = MockTransport::new(vec![MockTransport::ok(200)]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport.clone(), store);

        let webhook = WebhookConfig::new("ops", ChannelKind::Generic, "https://example.test/hook")
            .with_secret("hunter2");
        let request = dispatcher.build_request(&webhook, &alert(Severity::High));

        let signature = request
            .headers
            .iter()
            .find(|(name, _)| name == SIGNATURE_HEADER)
            .map(|(_, value)| value.clone())
            .expect("signature header present");
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature, sign_payload("hunter2", &request.body));

        let unsigned = WebhookConfig::new("ops", ChannelKind::Generic, "https://example.test/hook");
        let request = dispatcher.build_request(&unsigned, &alert(Severity::High));
        assert!(request.headers.iter().all(|(name, _)| name != SIGNATURE_HEADER));
    }

    #[tokio::test]
    async fn test_custom_headers_forwarded() {
        let transport = MockTransport::new(vec![MockTransport::ok(200)]);
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(transport, store);

        let mut webhook =
            WebhookConfig::new("ops", ChannelKind::Generic, "https://example.test/hook");
        webhook
            .headers
            .insert("X-Env".to_string(), "staging".to_string());

        let request = dispatcher.build_request(&webhook, &alert(Severity::Low));
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "X-Env" && value == "staging"));
        assert!(request.headers.iter().any(|(name, _)| name == "Content-Type"));
    }
}
