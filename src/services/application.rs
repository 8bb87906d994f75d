// Application Service
//
// Tenant lifecycle: create/read/update/delete, API-key issuance and
// rotation, and the cache-aside lookups the hot ingest path depends on.
// Cache write failures degrade to direct repository reads, never errors.

use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{keys, ttl, Cache};
use crate::error::AppError;
use crate::ident;
use crate::models::{Application, ApplicationSettings, PageRequest, Paginated};
use crate::repo::{ApplicationRepo, HitRepo, WebhookRepo};
use crate::validators;

/// Create payload. A missing id gets a fresh UUID.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub domain: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: Option<ApplicationSettings>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub url: Option<String>,
    pub active: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub settings: Option<ApplicationSettings>,
}

pub struct ApplicationService {
    apps: Arc<dyn ApplicationRepo>,
    hits: Arc<dyn HitRepo>,
    webhooks: Arc<dyn WebhookRepo>,
    cache: Cache,
    /// Bot-filter setting applied to tenants created without settings.
    bot_filter_default: bool,
}

impl ApplicationService {
    pub fn new(
        apps: Arc<dyn ApplicationRepo>,
        hits: Arc<dyn HitRepo>,
        webhooks: Arc<dyn WebhookRepo>,
        cache: Cache,
        bot_filter_default: bool,
    ) -> Self {
        Self {
            apps,
            hits,
            webhooks,
            cache,
            bot_filter_default,
        }
    }

    /// Cache writes are advisory: log and carry on.
    async fn prime_cache(&self, app: &Application) {
        if let Err(e) = self
            .cache
            .put_json(&keys::app_by_id(&app.id), app, ttl::APP)
            .await
        {
            warn!("cache prime failed for application {}: {e}", app.id);
        }
        if let Err(e) = self
            .cache
            .put_json(&keys::app_by_api_key(&app.api_key), app, ttl::APP)
            .await
        {
            warn!("cache prime failed for api key of {}: {e}", app.id);
        }
    }

    async fn evict_cache(&self, app: &Application) {
        let keys = vec![keys::app_by_id(&app.id), keys::app_by_api_key(&app.api_key)];
        if let Err(e) = self.cache.delete(&keys).await {
            warn!("cache evict failed for application {}: {e}", app.id);
        }
    }

    pub async fn create(&self, draft: ApplicationDraft) -> Result<Application, AppError> {
        let now = Utc::now();
        let id = match draft.id {
            Some(id) => {
                if !ident::app_id_is_well_formed(&id) {
                    return Err(AppError::Validation(vec![
                        "id must be a UUID or up to 50 chars of letters, digits, '_' or '-'"
                            .to_string(),
                    ]));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let app = Application {
            id,
            name: draft.name,
            description: draft.description,
            domain: draft.domain,
            url: draft.url,
            api_key: ident::generate_api_key(),
            active: true,
            tags: draft.tags,
            metadata: draft.metadata,
            settings: draft.settings.unwrap_or_else(|| ApplicationSettings {
                bot_filter_enabled: self.bot_filter_default,
                ..ApplicationSettings::default()
            }),
            created_at: now,
            updated_at: now,
        };
        validators::validate_application(&app, false)?;

        self.apps.insert(&app).await?;
        self.prime_cache(&app).await;
        info!("created application {}", app.id);
        Ok(app)
    }

    /// Cache-aside read under `app:id:<id>`.
    pub async fn get(&self, id: &str) -> Result<Application, AppError> {
        let key = keys::app_by_id(id);
        match self.cache.get_json::<Application>(&key).await {
            Ok(Some(app)) => return Ok(app),
            Ok(None) => {}
            Err(e) => warn!("cache read failed for application {id}: {e}"),
        }
        let app = self.apps.find_by_id(id).await?.ok_or_else(|| AppError::NotFound(format!("application {id} not found")))?;
        self.prime_cache(&app).await;
        Ok(app)
    }

    pub async fn list(
        &self,
        page: PageRequest,
        active_only: bool,
        tag: Option<&str>,
    ) -> Result<Paginated<Application>, AppError> {
        self.apps.list(page, active_only, tag).await
    }

    pub async fn update(
        &self,
        id: &str,
        update: ApplicationUpdate,
    ) -> Result<Application, AppError> {
        let mut app = self.apps.find_by_id(id).await?.ok_or_else(|| AppError::NotFound(format!("application {id} not found")))?;
        let old_api_key = app.api_key.clone();

        if let Some(name) = update.name {
            app.name = name;
        }
        if let Some(description) = update.description {
            app.description = Some(description);
        }
        if let Some(domain) = update.domain {
            app.domain = domain;
        }
        if let Some(url) = update.url {
            app.url = Some(url);
        }
        if let Some(active) = update.active {
            app.active = active;
        }
        if let Some(tags) = update.tags {
            app.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            app.metadata = metadata;
        }
        if let Some(settings) = update.settings {
            app.settings = settings;
        }
        app.updated_at = Utc::now();
        validators::validate_application(&app, true)?;

        self.apps.update(&app).await?;
        // Old key entry must go even though the key usually did not change
        if let Err(e) = self.cache.delete(&[keys::app_by_api_key(&old_api_key)]).await {
            warn!("cache evict failed for old api key of {id}: {e}");
        }
        self.prime_cache(&app).await;
        Ok(app)
    }

    /// Delete a tenant and everything hanging off it: hits, webhooks,
    /// cached entities, derived statistics and counters.
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let app = self.apps.find_by_id(id).await?.ok_or_else(|| AppError::NotFound(format!("application {id} not found")))?;

        self.hits.delete_for_app(id).await?;
        self.webhooks.delete_for_app(id).await?;
        self.apps.delete(id).await?;

        self.evict_cache(&app).await;
        for pattern in [
            keys::stats_pattern(id),
            format!("{}*", keys::pageviews(id)),
            format!("{}*", keys::referrers(id)),
            format!("{}*", keys::devices(id)),
            format!("{}*", keys::countries(id)),
        ] {
            if let Err(e) = self.cache.delete_pattern(&pattern).await {
                warn!("cache cleanup failed for {pattern}: {e}");
            }
        }
        info!("deleted application {id}");
        Ok(())
    }

    /// Rotate the API key. The old key stops resolving immediately.
    pub async fn regenerate_api_key(&self, id: &str) -> Result<Application, AppError> {
        let mut app = self.apps.find_by_id(id).await?.ok_or_else(|| AppError::NotFound(format!("application {id} not found")))?;
        let old_key = app.api_key.clone();
        app.api_key = ident::generate_api_key();
        app.updated_at = Utc::now();

        self.apps.update(&app).await?;
        if let Err(e) = self.cache.delete(&[keys::app_by_api_key(&old_key)]).await {
            warn!("cache evict failed for rotated key of {id}: {e}");
        }
        self.prime_cache(&app).await;
        info!("rotated api key for application {id}");
        Ok(app)
    }

    /// Resolve an API key to its tenant. Unknown keys are Unauthorized;
    /// keys of inactive tenants are Forbidden.
    pub async fn validate_api_key(&self, api_key: &str) -> Result<Application, AppError> {
        if !ident::api_key_is_well_formed(api_key) {
            return Err(AppError::Unauthorized("invalid api key".to_string()));
        }
        let key = keys::app_by_api_key(api_key);
        let app = match self.cache.get_json::<Application>(&key).await {
            Ok(Some(app)) => app,
            other => {
                if let Err(e) = other {
                    warn!("cache read failed for api key lookup: {e}");
                }
                let app = self
                    .apps
                    .find_by_api_key(api_key)
                    .await?
                    .ok_or_else(|| AppError::Unauthorized("unknown api key".to_string()))?;
                self.prime_cache(&app).await;
                app
            }
        };
        if !app.active {
            return Err(AppError::Forbidden("application is inactive".to_string()));
        }
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::repo::memory::{MemApplicationRepo, MemHitRepo, MemWebhookRepo};

    fn service() -> ApplicationService {
        service_with_bot_default(true)
    }

    fn service_with_bot_default(bot_filter_default: bool) -> ApplicationService {
        ApplicationService::new(
            Arc::new(MemApplicationRepo::new()),
            Arc::new(MemHitRepo::new()),
            Arc::new(MemWebhookRepo::new()),
            Cache::new(Arc::new(MemoryCache::new())),
            bot_filter_default,
        )
    }

    fn draft(name: &str) -> ApplicationDraft {
        ApplicationDraft {
            id: None,
            name: name.into(),
            description: None,
            domain: "example.com".into(),
            url: None,
            tags: vec![],
            metadata: Default::default(),
            settings: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_key() {
        let svc = service();
        let app = svc.create(draft("My Site")).await.unwrap();
        assert!(Uuid::parse_str(&app.id).is_ok());
        assert_eq!(app.api_key.len(), 32);
        assert!(app.active);

        let fetched = svc.get(&app.id).await.unwrap();
        assert_eq!(fetched, app);
    }

    #[tokio::test]
    async fn create_applies_configured_bot_filter_default() {
        let svc = service_with_bot_default(false);
        let app = svc.create(draft("Site")).await.unwrap();
        assert!(!app.settings.bot_filter_enabled);

        let mut explicit = draft("Other");
        explicit.settings = Some(ApplicationSettings {
            bot_filter_enabled: true,
            ..ApplicationSettings::default()
        });
        let app = svc.create(explicit).await.unwrap();
        assert!(app.settings.bot_filter_enabled);
    }

    #[tokio::test]
    async fn create_rejects_invalid_draft() {
        let svc = service();
        let mut bad = draft("");
        bad.domain = "not a domain".into();
        let err = svc.create(bad).await.unwrap_err();
        match err {
            AppError::Validation(details) => assert!(details.len() >= 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_key_lookup_enforces_active_flag() {
        let svc = service();
        let app = svc.create(draft("Site")).await.unwrap();

        let resolved = svc.validate_api_key(&app.api_key).await.unwrap();
        assert_eq!(resolved.id, app.id);

        svc.update(
            &app.id,
            ApplicationUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            svc.validate_api_key(&app.api_key).await,
            Err(AppError::Forbidden(_))
        ));

        assert!(matches!(
            svc.validate_api_key(&"a".repeat(32)).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            svc.validate_api_key("malformed").await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn rotation_invalidates_old_key() {
        let svc = service();
        let app = svc.create(draft("Site")).await.unwrap();
        let old_key = app.api_key.clone();

        let rotated = svc.regenerate_api_key(&app.id).await.unwrap();
        assert_ne!(rotated.api_key, old_key);

        assert!(matches!(
            svc.validate_api_key(&old_key).await,
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(
            svc.validate_api_key(&rotated.api_key).await.unwrap().id,
            app.id
        );
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let svc = service();
        let app = svc.create(draft("Site")).await.unwrap();
        svc.delete(&app.id).await.unwrap();
        assert!(matches!(svc.get(&app.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(svc.delete(&app.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_by_tag_and_active() {
        let svc = service();
        let mut d = draft("Tagged");
        d.tags = vec!["prod".into()];
        let tagged = svc.create(d).await.unwrap();
        let plain = svc.create(draft("Plain")).await.unwrap();
        svc.update(
            &plain.id,
            ApplicationUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let page = svc
            .list(PageRequest::default(), false, Some("prod"))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, tagged.id);

        let page = svc.list(PageRequest::default(), true, None).await.unwrap();
        assert_eq!(page.total, 1);
    }
}
