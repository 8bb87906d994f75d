// Tracking Service
//
// The ingest pipeline: tenant cross-check, bot and blocklist filtering,
// IP anonymization, session derivation, validation, persistence, counter
// bumps, and webhook fan-out. Only validation failures and the row-store
// write can fail the request; everything after the write is best-effort.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{keys, Cache};
use crate::classify;
use crate::error::AppError;
use crate::ident;
use crate::metrics::AppMetrics;
use crate::models::{
    Application, CustomParams, PageRequest, Paginated, Session, TrackingHit, WebhookEventKind,
};
use crate::repo::HitRepo;
use crate::services::webhook::WebhookService;
use crate::validators;

/// One ingest submission, from the POST body or beacon query string.
/// The HTTP layer fills user_agent / ip_address fallbacks from headers
/// before handing it over.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackRequest {
    #[serde(default)]
    pub app_id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub screen_resolution: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub custom_params: Option<CustomParams>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Ingest result. Filtered hits are acknowledged but never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TrackOutcome {
    pub filtered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TrackOutcome {
    fn filtered(reason: &str) -> Self {
        Self {
            filtered: true,
            reason: Some(reason.to_string()),
            hit_id: None,
            session_id: None,
        }
    }
}

pub struct TrackingService {
    hits: Arc<dyn HitRepo>,
    cache: Cache,
    webhooks: Arc<WebhookService>,
    metrics: Arc<AppMetrics>,
}

impl TrackingService {
    pub fn new(
        hits: Arc<dyn HitRepo>,
        cache: Cache,
        webhooks: Arc<WebhookService>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            hits,
            cache,
            webhooks,
            metrics,
        }
    }

    pub async fn ingest(
        &self,
        app: &Application,
        req: TrackRequest,
    ) -> Result<TrackOutcome, AppError> {
        // A payload claiming a different tenant than the one the API key
        // resolved to is an authorization failure, not a validation one.
        if let Some(claimed) = &req.app_id {
            if claimed != &app.id {
                return Err(AppError::Forbidden(
                    "app_id does not match the authenticated application".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let user_agent = req.user_agent.unwrap_or_default();
        let raw_ip = req.ip_address.filter(|s| !s.is_empty());

        if let Some(ip) = &raw_ip {
            if app.settings.blocked_ips.iter().any(|b| b == ip) {
                self.metrics.record_hit_filtered("blocked_ip");
                return Ok(TrackOutcome::filtered("blocked_ip"));
            }
        }

        let profile = classify::classify_user_agent(&user_agent);
        if profile.is_bot && app.settings.bot_filter_enabled {
            self.metrics.record_hit_filtered("bot");
            return Ok(TrackOutcome::filtered("bot"));
        }

        // Session identity is derived from the raw IP; only the stored
        // copy is anonymized.
        let session_id = match req.session_id.filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => ident::derive_session_id(
                &user_agent,
                raw_ip.as_deref().unwrap_or(""),
                &app.id,
            ),
        };
        let anonymized_ip = raw_ip.as_deref().and_then(classify::anonymize_ip_str);

        let mut hit = TrackingHit {
            id: Uuid::new_v4(),
            app_id: app.id.clone(),
            session_id: session_id.clone(),
            url: req.url,
            referrer: req.referrer.filter(|s| !s.is_empty()),
            user_agent: user_agent.clone(),
            ua_hash: ident::user_agent_hash(&user_agent),
            ip_address: anonymized_ip,
            device: profile.device,
            browser: profile.browser,
            os: profile.os,
            is_bot: profile.is_bot,
            screen_resolution: req.screen_resolution.filter(|s| !s.is_empty()),
            language: req.language.filter(|s| !s.is_empty()),
            timezone: req.timezone.filter(|s| !s.is_empty()),
            country: req.country.filter(|s| !s.is_empty()),
            custom_params: req.custom_params,
            timestamp: req.timestamp.unwrap_or(now),
        };

        validators::validate_hit(
            &hit,
            now,
            Duration::days(i64::from(app.settings.retention_days)),
            app.settings.max_custom_params as usize,
        )?;

        // Privacy toggles redact after validation, before persistence
        if !app.settings.collect_ip {
            hit.ip_address = None;
        }
        if !app.settings.collect_user_agent {
            hit.user_agent = String::new();
        }

        self.hits.insert(&hit).await?;
        self.metrics.record_hit_ingested();

        // Session presence is only marked once the hit is durable, so a
        // failed insert cannot suppress session_started on the retry.
        let new_session = self.touch_session(app, &session_id, now).await;
        self.bump_counters(&hit).await;
        self.fan_out(app, &hit, new_session);

        Ok(TrackOutcome {
            filtered: false,
            reason: None,
            hit_id: Some(hit.id),
            session_id: Some(session_id),
        })
    }

    /// Mark the session live for the tenant's timeout window; returns
    /// whether this hit started a new session. Cache trouble degrades to
    /// "existing" so receivers are not spammed with session_started.
    async fn touch_session(
        &self,
        app: &Application,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = keys::session(session_id);
        let new_session = match self.cache.store().exists(&key).await {
            Ok(exists) => !exists,
            Err(e) => {
                warn!("session probe failed for {session_id}: {e}");
                false
            }
        };
        if let Err(e) = self
            .cache
            .store()
            .set(
                &key,
                &now.to_rfc3339(),
                Some(u64::from(app.settings.session_timeout_secs)),
            )
            .await
        {
            warn!("session refresh failed for {session_id}: {e}");
        }
        new_session
    }

    /// Best-effort ranking counters, pipelined into one round trip.
    async fn bump_counters(&self, hit: &TrackingHit) {
        let mut bumps = vec![
            (keys::pageviews(&hit.app_id), hit.url.clone()),
            (keys::devices(&hit.app_id), hit.device.as_str().to_string()),
        ];
        if let Some(referrer) = &hit.referrer {
            bumps.push((keys::referrers(&hit.app_id), referrer.clone()));
        }
        if let Some(country) = &hit.country {
            bumps.push((keys::countries(&hit.app_id), country.clone()));
        }
        if let Err(e) = self.cache.store().zincr_batch(&bumps).await {
            warn!("counter bump failed for {}: {e}", hit.app_id);
        }
    }

    /// Webhook fan-out happens off the request path.
    fn fan_out(&self, app: &Application, hit: &TrackingHit, new_session: bool) {
        let webhooks = Arc::clone(&self.webhooks);
        let app_id = app.id.clone();
        let body = serde_json::json!({
            "hit_id": hit.id,
            "url": hit.url,
            "session_id": hit.session_id,
            "device": hit.device,
            "browser": hit.browser,
            "os": hit.os,
            "country": hit.country,
            "timestamp": hit.timestamp,
        });
        let session_body = serde_json::json!({
            "session_id": hit.session_id,
            "entry_url": hit.url,
            "started_at": hit.timestamp,
        });
        tokio::spawn(async move {
            if new_session {
                webhooks
                    .dispatch(&app_id, WebhookEventKind::SessionStarted, session_body)
                    .await;
            }
            webhooks
                .dispatch(&app_id, WebhookEventKind::PageView, body)
                .await;
        });
    }

    /// Paged session summaries materialized from hits.
    pub async fn sessions_window(
        &self,
        app: &Application,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Paginated<Session>, AppError> {
        self.hits.sessions_window(&app.id, start, end, page).await
    }
}
