// trackbeam - Multi-Tenant Web Analytics Service
//
// Wires configuration, Postgres, Redis, the service layer, and the HTTP
// surface together, and runs the periodic retention sweeper.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use trackbeam::cache::{Cache, RedisCache};
use trackbeam::config::Config;
use trackbeam::http::health::{CachePing, DbPing, HealthChecker, Pingable};
use trackbeam::http::{self, AppState};
use trackbeam::metrics::AppMetrics;
use trackbeam::repo::{
    ApplicationRepo, Database, HitRepo, PgApplicationRepo, PgHitRepo, PgWebhookRepo,
};
use trackbeam::services::webhook::HttpTransport;
use trackbeam::services::{
    ApplicationService, StatisticsService, TrackingService, WebhookService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("trackbeam={},sqlx=warn", config.log_level))
        .init();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    info!("Starting trackbeam");
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_address);
    info!("  - Database pool size: {}", config.database_pool_size);
    info!("  - Redis pool size: {}", config.redis_pool_size);
    info!("  - Default retention: {} days", config.retention_days);
    info!("  - Sweep interval: {}s", config.sweep_interval_secs);
    info!("  - Max body bytes: {}", config.max_body_bytes);

    let metrics = Arc::new(AppMetrics::new());

    let db = match Database::new(&config.database_url, config.database_pool_size).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("postgres unavailable: {e:#}");
            std::process::exit(2);
        }
    };
    if let Err(e) = db.setup_schema().await {
        error!("schema setup failed: {e:#}");
        std::process::exit(2);
    }

    let redis = match RedisCache::new(&config.redis_url, config.redis_pool_size, metrics.clone())
        .await
    {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            error!("redis unavailable: {e:#}");
            std::process::exit(2);
        }
    };
    let cache = Cache::new(redis.clone());

    let apps: Arc<dyn ApplicationRepo> = Arc::new(PgApplicationRepo::new(&db, metrics.clone()));
    let hits: Arc<dyn HitRepo> = Arc::new(PgHitRepo::new(&db, metrics.clone()));
    let hooks = Arc::new(PgWebhookRepo::new(&db, metrics.clone()));

    let transport = Arc::new(HttpTransport::new()?);
    let webhooks = Arc::new(WebhookService::new(
        hooks.clone(),
        cache.clone(),
        transport,
        metrics.clone(),
    ));
    let applications = Arc::new(ApplicationService::new(
        apps.clone(),
        hits.clone(),
        hooks,
        cache.clone(),
        config.bot_filter_default,
    ));
    let tracking = Arc::new(TrackingService::new(
        hits.clone(),
        cache.clone(),
        webhooks.clone(),
        metrics.clone(),
    ));
    let statistics = Arc::new(StatisticsService::new(
        hits.clone(),
        cache.clone(),
        webhooks.clone(),
    ));

    let health: Vec<Arc<dyn Pingable>> = vec![
        Arc::new(DbPing(db.clone())),
        Arc::new(CachePing(redis)),
    ];
    let state = AppState {
        applications,
        tracking,
        statistics,
        webhooks,
        health: Arc::new(HealthChecker::new(health)),
        metrics: metrics.clone(),
    };

    if config.sweep_interval_secs > 0 {
        tokio::spawn(retention_sweeper(
            apps,
            hits,
            config.sweep_interval_secs,
            config.retention_days,
        ));
    }

    let app = http::router(state, config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;

    info!("===========================================");
    info!("trackbeam ready");
    info!("===========================================");
    info!("Ingest endpoint:  http://{}/v1/track", config.bind_address);
    info!("Beacon endpoint:  http://{}/v1/beacon.gif", config.bind_address);
    info!("Metrics endpoint: http://{}/metrics", config.bind_address);
    info!("Health endpoint:  http://{}/v1/health", config.bind_address);
    info!("===========================================");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Periodically drops hits older than each tenant's retention horizon.
async fn retention_sweeper(
    apps: Arc<dyn ApplicationRepo>,
    hits: Arc<dyn HitRepo>,
    interval_secs: u64,
    default_retention_days: u32,
) {
    loop {
        sleep(Duration::from_secs(interval_secs)).await;

        let ids = match apps.list_all_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("retention sweep skipped, tenant listing failed: {e}");
                continue;
            }
        };

        let mut purged = 0u64;
        for id in ids {
            let retention_days = match apps.find_by_id(&id).await {
                Ok(Some(app)) => app.settings.retention_days,
                Ok(None) => continue,
                Err(e) => {
                    warn!("retention sweep skipped for {id}: {e}");
                    continue;
                }
            };
            let days = if retention_days > 0 {
                retention_days
            } else {
                default_retention_days
            };
            let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
            match hits.purge_before(&id, cutoff).await {
                Ok(n) => purged += n,
                Err(e) => warn!("retention purge failed for {id}: {e}"),
            }
        }
        if purged > 0 {
            info!("retention sweep removed {purged} expired hits");
        }
    }
}
