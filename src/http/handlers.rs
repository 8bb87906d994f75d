// Request Handlers
//
// Ingest (POST body and beacon pixel), embedded asset delivery with ETag
// revalidation, tenant administration, statistics, sessions, and webhook
// management. The tenant plane authenticates with X-API-Key; the admin
// plane sits behind the deployment's own access control.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::classify;
use crate::error::AppError;
use crate::ident;
use crate::models::{Application, PageRequest, StatsPeriod};
use crate::services::application::{ApplicationDraft, ApplicationUpdate};
use crate::services::tracking::TrackRequest;
use crate::services::webhook::{WebhookDraft, WebhookUpdate};

use super::{assets, ok, AppState};

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

/// Resolve the calling tenant from X-API-Key.
async fn tenant_from_key(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Application, AppError> {
    let key = api_key(headers).ok_or_else(|| AppError::Unauthorized("missing X-API-Key header".to_string()))?;
    state.applications.validate_api_key(key).await
}

/// A key is optional on read paths, but when present it must belong to
/// the tenant being read.
async fn enforce_tenant_scope(
    state: &AppState,
    headers: &HeaderMap,
    app: &Application,
) -> Result<(), AppError> {
    if let Some(key) = api_key(headers) {
        let caller = state.applications.validate_api_key(key).await?;
        if caller.id != app.id {
            return Err(AppError::Forbidden(
                "api key is not valid for this application".to_string(),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingest

pub async fn track(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(mut req): Json<TrackRequest>,
) -> Result<Response, AppError> {
    let app = tenant_from_key(&state, &headers).await?;

    // Header fallbacks for fields the client did not send
    if req.user_agent.as_deref().map_or(true, str::is_empty) {
        req.user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
    }
    if req.ip_address.as_deref().map_or(true, str::is_empty) {
        req.ip_address = classify::extract_client_ip(&headers, connect.map(|c| c.0.ip()))
            .map(|ip| ip.to_string());
    }

    let outcome = state.tracking.ingest(&app, req).await?;
    Ok(ok(outcome).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BeaconQuery {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
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
}

/// GET pixel for environments that cannot POST. Resolves the tenant by
/// app_id instead of API key; the page URL falls back to the Referer.
pub async fn beacon(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(q): Query<BeaconQuery>,
) -> Result<Response, AppError> {
    let app_id = q
        .app_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation(vec!["app_id query parameter is required".into()]))?;
    let app = state.applications.get(&app_id).await?;
    if !app.active {
        return Err(AppError::Forbidden("application is inactive".to_string()));
    }

    let url = q
        .url
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .ok_or_else(|| AppError::Validation(vec!["url query parameter is required".into()]))?;

    let req = TrackRequest {
        app_id: None,
        url,
        referrer: q.referrer,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        ip_address: classify::extract_client_ip(&headers, connect.map(|c| c.0.ip()))
            .map(|ip| ip.to_string()),
        session_id: q.session_id,
        screen_resolution: q.screen_resolution,
        language: q.language,
        timezone: q.timezone,
        country: q.country,
        custom_params: None,
        timestamp: None,
    };
    state.tracking.ingest(&app, req).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        assets::BEACON_GIF.to_vec(),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Embedded assets

fn asset_response(headers: &HeaderMap, body: &'static str) -> Response {
    let etag = ident::asset_etag(body.as_bytes());
    if let Some(tag) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if tag == etag {
            return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
        }
    }
    (
        [
            (header::CONTENT_TYPE, "application/javascript".to_string()),
            (header::CACHE_CONTROL, "public, max-age=3600".to_string()),
            (header::ETAG, etag),
        ],
        body,
    )
        .into_response()
}

pub async fn tracker_js(headers: HeaderMap) -> Response {
    asset_response(&headers, assets::TRACKER_JS)
}

pub async fn tracker_min_js(headers: HeaderMap) -> Response {
    asset_response(&headers, assets::TRACKER_MIN_JS)
}

// ---------------------------------------------------------------------------
// Applications

pub async fn create_application(
    State(state): State<AppState>,
    Json(draft): Json<ApplicationDraft>,
) -> Result<Response, AppError> {
    let app = state.applications.create(draft).await?;
    Ok((StatusCode::CREATED, ok(app)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub tag: Option<String>,
}

pub async fn list_applications(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Response, AppError> {
    let page = PageRequest::clamped(q.page, q.page_size);
    let apps = state
        .applications
        .list(page, q.active.unwrap_or(false), q.tag.as_deref())
        .await?;
    Ok(ok(apps).into_response())
}

pub async fn get_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(ok(state.applications.get(&id).await?).into_response())
}

pub async fn update_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ApplicationUpdate>,
) -> Result<Response, AppError> {
    Ok(ok(state.applications.update(&id, update).await?).into_response())
}

pub async fn delete_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.applications.delete(&id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })).into_response())
}

pub async fn regenerate_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(ok(state.applications.regenerate_api_key(&id).await?).into_response())
}

// ---------------------------------------------------------------------------
// Statistics and sessions

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub period: Option<String>,
}

pub async fn statistics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(q): Query<StatsQuery>,
) -> Result<Response, AppError> {
    let app = state.applications.get(&id).await?;
    enforce_tenant_scope(&state, &headers, &app).await?;

    let period = match q.period.as_deref() {
        Some(s) => StatsPeriod::from_str(s).map_err(|e| AppError::Validation(vec![e]))?,
        None => StatsPeriod::Daily,
    };
    Ok(ok(state.statistics.snapshot(&app, period).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// Session summaries for a window, defaulting to the last 24 hours.
pub async fn sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(q): Query<WindowQuery>,
) -> Result<Response, AppError> {
    let app = state.applications.get(&id).await?;
    enforce_tenant_scope(&state, &headers, &app).await?;

    let end = q.end.unwrap_or_else(Utc::now);
    let start = q.start.unwrap_or(end - Duration::hours(24));
    if start >= end {
        return Err(AppError::Validation(vec![
            "start must precede end".into(),
        ]));
    }
    let page = PageRequest::clamped(q.page, q.page_size);
    Ok(ok(state.tracking.sessions_window(&app, start, end, page).await?).into_response())
}

// ---------------------------------------------------------------------------
// Webhooks

pub async fn list_webhooks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let app = state.applications.get(&id).await?;
    Ok(ok(state.webhooks.list(&app.id).await?).into_response())
}

pub async fn create_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<WebhookDraft>,
) -> Result<Response, AppError> {
    let app = state.applications.get(&id).await?;
    let webhook = state.webhooks.create(&app.id, draft).await?;
    Ok((StatusCode::CREATED, ok(webhook)).into_response())
}

pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<WebhookUpdate>,
) -> Result<Response, AppError> {
    let tenant = tenant_from_key(&state, &headers).await?;
    Ok(ok(state.webhooks.update(&tenant.id, id, update).await?).into_response())
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_from_key(&state, &headers).await?;
    state.webhooks.delete(&tenant.id, id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })).into_response())
}

pub async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_from_key(&state, &headers).await?;
    Ok(ok(state.webhooks.send_test(&tenant.id, id).await?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::http::{self, health::HealthChecker};
    use crate::metrics::AppMetrics;
    use crate::repo::memory::{MemApplicationRepo, MemHitRepo, MemWebhookRepo};
    use crate::services::webhook::DeliveryTransport;
    use crate::services::{
        ApplicationService, StatisticsService, TrackingService, WebhookService,
    };
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NullTransport;

    #[async_trait]
    impl DeliveryTransport for NullTransport {
        async fn post(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: Vec<u8>,
        ) -> anyhow::Result<u16> {
            Ok(200)
        }
    }

    fn router() -> Router {
        let apps = Arc::new(MemApplicationRepo::new());
        let hits = Arc::new(MemHitRepo::new());
        let hooks = Arc::new(MemWebhookRepo::new());
        let cache = Cache::new(Arc::new(MemoryCache::new()));
        let metrics = Arc::new(AppMetrics::new());
        let webhooks = Arc::new(WebhookService::new(
            hooks.clone(),
            cache.clone(),
            Arc::new(NullTransport),
            metrics.clone(),
        ));
        let state = AppState {
            applications: Arc::new(ApplicationService::new(
                apps,
                hits.clone(),
                hooks,
                cache.clone(),
                true,
            )),
            tracking: Arc::new(TrackingService::new(
                hits.clone(),
                cache.clone(),
                webhooks.clone(),
                metrics.clone(),
            )),
            statistics: Arc::new(StatisticsService::new(hits, cache, webhooks.clone())),
            webhooks,
            health: Arc::new(HealthChecker::new(vec![])),
            metrics,
        };
        http::router(state, 1024 * 1024)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_app(router: &Router) -> (String, String) {
        let resp = router
            .clone()
            .oneshot(
                Request::post("/v1/applications")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name":"Site","domain":"example.com"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        (
            json["data"]["id"].as_str().unwrap().to_string(),
            json["data"]["api_key"].as_str().unwrap().to_string(),
        )
    }

    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64) Chrome/120.0 Safari/537.36";

    #[tokio::test]
    async fn track_requires_api_key() {
        let router = router();
        let resp = router
            .oneshot(
                Request::post("/v1/track")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"url":"https://e.com/"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn track_accepts_a_keyed_hit() {
        let router = router();
        let (_, key) = create_app(&router).await;
        let resp = router
            .oneshot(
                Request::post("/v1/track")
                    .header("content-type", "application/json")
                    .header("x-api-key", &key)
                    .header("user-agent", UA)
                    .header("x-forwarded-for", "203.0.113.42")
                    .body(Body::from(r#"{"url":"https://e.com/page"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["filtered"], false);
        assert!(json["data"]["hit_id"].is_string());
    }

    #[tokio::test]
    async fn beacon_resolves_by_app_id() {
        let router = router();
        let (id, _) = create_app(&router).await;

        // Missing app_id
        let resp = router
            .clone()
            .oneshot(Request::get("/v1/beacon.gif").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Unknown tenant
        let resp = router
            .clone()
            .oneshot(
                Request::get("/v1/beacon.gif?app_id=nope&url=https%3A%2F%2Fe.com%2F")
                    .header("user-agent", UA)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(
                Request::get(format!(
                    "/v1/beacon.gif?app_id={id}&url=https%3A%2F%2Fe.com%2Fpage"
                ))
                .header("user-agent", UA)
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "image/gif"
        );
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), assets::BEACON_GIF.as_slice());
    }

    #[tokio::test]
    async fn tracker_script_revalidates_with_etag() {
        let router = router();
        let resp = router
            .clone()
            .oneshot(Request::get("/v1/tracker.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/javascript"
        );
        let etag = resp.headers()[header::ETAG].to_str().unwrap().to_string();

        let resp = router
            .oneshot(
                Request::get("/v1/tracker.js")
                    .header(header::IF_NONE_MATCH, &etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn application_crud_round_trip() {
        let router = router();
        let (id, _) = create_app(&router).await;

        let resp = router
            .clone()
            .oneshot(
                Request::put(format!("/v1/applications/{id}"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"Renamed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["name"], "Renamed");

        let resp = router
            .clone()
            .oneshot(
                Request::delete(format!("/v1/applications/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(
                Request::get(format!("/v1/applications/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn statistics_rejects_foreign_api_key() {
        let router = router();
        let (id, _) = create_app(&router).await;
        let (_, other_key) = create_app(&router).await;

        let resp = router
            .clone()
            .oneshot(
                Request::get(format!("/v1/applications/{id}/statistics?period=daily"))
                    .header("x-api-key", &other_key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = router
            .clone()
            .oneshot(
                Request::get(format!("/v1/applications/{id}/statistics?period=hourly"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(
                Request::get(format!("/v1/applications/{id}/statistics"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["period"], "daily");
    }

    #[tokio::test]
    async fn webhook_routes_scope_by_api_key() {
        let router = router();
        let (id, key) = create_app(&router).await;
        let (_, other_key) = create_app(&router).await;

        let resp = router
            .clone()
            .oneshot(
                Request::post(format!("/v1/applications/{id}/webhooks"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url":"https://hooks.example/in","events":["page_view"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let hook_id = body_json(resp).await["data"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        // A foreign tenant's key cannot touch the subscription
        let resp = router
            .clone()
            .oneshot(
                Request::delete(format!("/v1/webhooks/{hook_id}"))
                    .header("x-api-key", &other_key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(
                Request::delete(format!("/v1/webhooks/{hook_id}"))
                    .header("x-api-key", &key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn probes_and_metrics_respond() {
        let router = router();
        let resp = router
            .clone()
            .oneshot(Request::get("/livez").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The probe above was recorded by the middleware
        let resp = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("http_requests_total"));
    }
}
