// Webhook Service
//
// Subscription CRUD plus signed, rate-limited, fire-and-forget delivery.
// Every attempt leaves an audit row; there are no retries, the receiver
// owns its own reliability.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{keys, ttl, Cache};
use crate::error::AppError;
use crate::ident;
use crate::metrics::AppMetrics;
use crate::models::{Webhook, WebhookDelivery, WebhookEnvelope, WebhookEventKind};
use crate::repo::WebhookRepo;
use crate::validators;

/// Per-delivery deadline covering connect, send, and response.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Deliveries allowed per subscription per rolling minute.
pub const RATE_LIMIT_MAX: i64 = 60;

const SENDER_USER_AGENT: &str = concat!("trackbeam-webhook/", env!("CARGO_PKG_VERSION"));

/// Headers the sender owns; custom headers never override these.
const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "user-agent",
    "x-webhook-id",
    "x-webhook-event",
    "x-webhook-signature",
];

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookDraft {
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<WebhookEventKind>>,
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub custom_headers: Option<BTreeMap<String, String>>,
}

/// Result of one delivery attempt, as written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeliveryOutcome {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    pub duration_ms: i64,
}

/// Outbound HTTP seam so delivery logic is testable without a listener.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> anyhow::Result<u16>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> anyhow::Result<u16> {
        let mut req = self.client.post(url).body(body);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
        Ok(resp.status().as_u16())
    }
}

pub struct WebhookService {
    webhooks: Arc<dyn WebhookRepo>,
    cache: Cache,
    transport: Arc<dyn DeliveryTransport>,
    metrics: Arc<AppMetrics>,
}

impl WebhookService {
    pub fn new(
        webhooks: Arc<dyn WebhookRepo>,
        cache: Cache,
        transport: Arc<dyn DeliveryTransport>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            webhooks,
            cache,
            transport,
            metrics,
        }
    }

    pub async fn create(&self, app_id: &str, draft: WebhookDraft) -> Result<Webhook, AppError> {
        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            url: draft.url,
            events: draft.events,
            secret: draft.secret.unwrap_or_else(ident::generate_api_key),
            active: true,
            custom_headers: draft.custom_headers,
            created_at: now,
            updated_at: now,
        };
        validators::validate_webhook(&webhook)?;
        self.webhooks.insert(&webhook).await?;
        Ok(webhook)
    }

    pub async fn get(&self, app_id: &str, id: Uuid) -> Result<Webhook, AppError> {
        self.webhooks
            .find(app_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("webhook {id} not found")))
    }

    pub async fn list(&self, app_id: &str) -> Result<Vec<Webhook>, AppError> {
        self.webhooks.list_for_app(app_id).await
    }

    pub async fn update(
        &self,
        app_id: &str,
        id: Uuid,
        update: WebhookUpdate,
    ) -> Result<Webhook, AppError> {
        let mut webhook = self.get(app_id, id).await?;
        if let Some(url) = update.url {
            webhook.url = url;
        }
        if let Some(events) = update.events {
            webhook.events = events;
        }
        if let Some(secret) = update.secret {
            webhook.secret = secret;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        if let Some(headers) = update.custom_headers {
            webhook.custom_headers = headers;
        }
        webhook.updated_at = Utc::now();
        validators::validate_webhook(&webhook)?;
        self.webhooks.update(&webhook).await?;
        Ok(webhook)
    }

    pub async fn delete(&self, app_id: &str, id: Uuid) -> Result<(), AppError> {
        if !self.webhooks.delete(app_id, id).await? {
            return Err(AppError::NotFound(format!("webhook {id} not found")));
        }
        Ok(())
    }

    /// Deliver one event to every active subscription of the tenant that
    /// opted into it. Per-subscription failures are logged, never bubbled.
    pub async fn dispatch(&self, app_id: &str, event: WebhookEventKind, body: serde_json::Value) {
        let subscribed = match self.webhooks.list_subscribed(app_id, event).await {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!("webhook lookup failed for {app_id}: {e}");
                return;
            }
        };
        let envelope = WebhookEnvelope {
            event,
            timestamp: Utc::now(),
            tenant: app_id.to_string(),
            body,
        };
        for webhook in subscribed {
            if let Err(e) = self.deliver(&webhook, &envelope).await {
                warn!("webhook {} delivery failed: {e}", webhook.id);
            }
        }
    }

    /// Fire a synthetic test event at one subscription and report the
    /// outcome to the caller.
    pub async fn send_test(&self, app_id: &str, id: Uuid) -> Result<DeliveryOutcome, AppError> {
        let webhook = self.get(app_id, id).await?;
        let envelope = WebhookEnvelope {
            event: WebhookEventKind::Test,
            timestamp: Utc::now(),
            tenant: app_id.to_string(),
            body: serde_json::json!({ "message": "test delivery" }),
        };
        self.deliver(&webhook, &envelope).await
    }

    /// Sliding-window limiter: INCR plus EXPIRE on first increment. A
    /// cache outage fails open, deliveries proceed unthrottled.
    async fn over_rate_limit(&self, webhook_id: Uuid) -> bool {
        let key = keys::webhook_rate(&webhook_id.to_string());
        match self.cache.store().incrby(&key, 1).await {
            Ok(count) => {
                if count == 1 {
                    if let Err(e) = self.cache.store().expire(&key, ttl::RATE_WINDOW).await {
                        warn!("rate window expire failed for {webhook_id}: {e}");
                    }
                }
                count > RATE_LIMIT_MAX
            }
            Err(e) => {
                warn!("rate limiter unavailable for {webhook_id}: {e}");
                false
            }
        }
    }

    async fn deliver(
        &self,
        webhook: &Webhook,
        envelope: &WebhookEnvelope,
    ) -> Result<DeliveryOutcome, AppError> {
        // The destination is re-checked at send time; a row edited outside
        // the service must not turn the sender into an arbitrary-scheme client.
        let scheme_ok = url::Url::parse(&webhook.url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !scheme_ok {
            return Err(AppError::Validation(vec![format!(
                "webhook {} url must be http or https",
                webhook.id
            )]));
        }

        if self.over_rate_limit(webhook.id).await {
            let outcome = DeliveryOutcome {
                outcome: "rate_limited".to_string(),
                status: None,
                duration_ms: 0,
            };
            self.audit(webhook, envelope.event, &outcome).await;
            return Err(AppError::RateLimited("delivery rate limit exceeded".to_string()));
        }

        let body = serde_json::to_vec(envelope).map_err(|e| AppError::Internal(e.into()))?;
        let signature = ident::webhook_signature(&webhook.secret, &body);

        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), SENDER_USER_AGENT.to_string()),
            ("X-Webhook-Id".to_string(), webhook.id.to_string()),
            ("X-Webhook-Event".to_string(), envelope.event.as_str().to_string()),
            ("X-Webhook-Signature".to_string(), signature),
        ];
        for (name, value) in &webhook.custom_headers {
            if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            headers.push((name.clone(), value.clone()));
        }

        let start = Instant::now();
        let result = self.transport.post(&webhook.url, &headers, body).await;
        let duration_ms = start.elapsed().as_millis() as i64;

        let outcome = match result {
            Ok(status) if (200..300).contains(&status) => DeliveryOutcome {
                outcome: "success".to_string(),
                status: Some(status as i32),
                duration_ms,
            },
            Ok(status) => DeliveryOutcome {
                outcome: "error".to_string(),
                status: Some(status as i32),
                duration_ms,
            },
            Err(e) => {
                warn!("webhook {} transport error: {e}", webhook.id);
                DeliveryOutcome {
                    outcome: "error".to_string(),
                    status: None,
                    duration_ms,
                }
            }
        };

        self.audit(webhook, envelope.event, &outcome).await;
        Ok(outcome)
    }

    async fn audit(&self, webhook: &Webhook, event: WebhookEventKind, outcome: &DeliveryOutcome) {
        self.metrics.record_webhook_delivery(
            &outcome.outcome,
            outcome.duration_ms as f64 / 1000.0,
        );
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            event,
            outcome: outcome.outcome.clone(),
            status: outcome.status,
            duration_ms: outcome.duration_ms,
            created_at: Utc::now(),
        };
        if let Err(e) = self.webhooks.record_delivery(&delivery).await {
            warn!("delivery audit write failed for {}: {e}", webhook.id);
        }
    }
}
