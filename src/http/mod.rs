// HTTP Surface
//
// Router, shared state, response envelope, and per-request metrics.
// Handlers stay thin: authenticate, parse, delegate to a service, wrap.

pub mod assets;
pub mod handlers;
pub mod health;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;

use crate::metrics::AppMetrics;
use crate::services::{ApplicationService, StatisticsService, TrackingService, WebhookService};

#[derive(Clone)]
pub struct AppState {
    pub applications: Arc<ApplicationService>,
    pub tracking: Arc<TrackingService>,
    pub statistics: Arc<StatisticsService>,
    pub webhooks: Arc<WebhookService>,
    pub health: Arc<health::HealthChecker>,
    pub metrics: Arc<AppMetrics>,
}

/// Uniform success envelope; errors carry their own envelope via
/// [`crate::error::AppError`].
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/v1/track", post(handlers::track))
        .route("/v1/beacon.gif", get(handlers::beacon))
        .route("/v1/tracker.js", get(handlers::tracker_js))
        .route("/v1/tracker.min.js", get(handlers::tracker_min_js))
        .route(
            "/v1/applications",
            post(handlers::create_application).get(handlers::list_applications),
        )
        .route(
            "/v1/applications/:id",
            get(handlers::get_application)
                .put(handlers::update_application)
                .delete(handlers::delete_application),
        )
        .route(
            "/v1/applications/:id/regenerate-api-key",
            post(handlers::regenerate_api_key),
        )
        .route(
            "/v1/applications/:id/statistics",
            get(handlers::statistics),
        )
        .route("/v1/applications/:id/sessions", get(handlers::sessions))
        .route(
            "/v1/applications/:id/webhooks",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route(
            "/v1/webhooks/:id",
            put(handlers::update_webhook).delete(handlers::delete_webhook),
        )
        .route("/v1/webhooks/:id/test", post(handlers::test_webhook))
        .route("/v1/health", get(health::health))
        .route("/readyz", get(health::readyz))
        .route("/livez", get(health::livez))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            record_request,
        ))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn record_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let resp = next.run(req).await;
    state.metrics.record_http_request(
        &method,
        &route,
        resp.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    resp
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
        .into_response()
}
