// Repository Layer
//
// Durable storage behind trait seams so the services can be exercised
// against in-memory fakes. Production is PostgreSQL with a tuned pool;
// hits are append-only and sessions are materialized on read by grouping
// hits on session id.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::AppMetrics;
use crate::models::{
    Application, PageRequest, Paginated, Session, TopEntry, TrackingHit, WebhookDelivery,
    Webhook, WebhookEventKind, WindowAggregate,
};

/// Number of entries kept in each top-N ranking.
pub const TOP_N: i64 = 10;

#[async_trait]
pub trait ApplicationRepo: Send + Sync {
    async fn insert(&self, app: &Application) -> Result<(), AppError>;
    async fn update(&self, app: &Application) -> Result<(), AppError>;
    async fn delete(&self, id: &str) -> Result<(), AppError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Application>, AppError>;
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Application>, AppError>;
    async fn list(
        &self,
        page: PageRequest,
        active_only: bool,
        tag: Option<&str>,
    ) -> Result<Paginated<Application>, AppError>;
    async fn list_all_ids(&self) -> Result<Vec<String>, AppError>;
}

#[async_trait]
pub trait HitRepo: Send + Sync {
    async fn insert(&self, hit: &TrackingHit) -> Result<(), AppError>;
    async fn insert_batch(&self, hits: &[TrackingHit]) -> Result<u64, AppError>;
    /// Full aggregate for one window: totals, session-derived averages,
    /// returning/new split, and the top-N rankings.
    async fn aggregate_window(
        &self,
        app_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        active_cutoff: DateTime<Utc>,
    ) -> Result<WindowAggregate, AppError>;
    /// Cheap (total hits, unique visitors) pair for one sub-bucket.
    async fn bucket_counts(
        &self,
        app_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(i64, i64), AppError>;
    async fn sessions_window(
        &self,
        app_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Paginated<Session>, AppError>;
    /// Drop hits older than the cutoff for one tenant; returns rows removed.
    async fn purge_before(&self, app_id: &str, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
    async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError>;
}

#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn insert(&self, webhook: &Webhook) -> Result<(), AppError>;
    async fn update(&self, webhook: &Webhook) -> Result<(), AppError>;
    async fn delete(&self, app_id: &str, id: Uuid) -> Result<bool, AppError>;
    async fn find(&self, app_id: &str, id: Uuid) -> Result<Option<Webhook>, AppError>;
    async fn list_for_app(&self, app_id: &str) -> Result<Vec<Webhook>, AppError>;
    /// Active subscriptions for one tenant that include the given event.
    async fn list_subscribed(
        &self,
        app_id: &str,
        event: WebhookEventKind,
    ) -> Result<Vec<Webhook>, AppError>;
    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), AppError>;
    async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Shared Postgres handle with pool settings tuned for a write-heavy
/// ingest workload.
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, pool_size: u32) -> anyhow::Result<Self> {
        // Server-side statement_timeout caps query execution; acquire_timeout
        // only bounds how long a caller waits for a free connection.
        let options = database_url
            .parse::<sqlx::postgres::PgConnectOptions>()?
            .options([("statement_timeout", "10000")]);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(pool_size)
            .min_connections(pool_size / 2)
            .acquire_timeout(StdDuration::from_secs(5))
            .idle_timeout(StdDuration::from_secs(600))
            .max_lifetime(StdDuration::from_secs(1800))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Setup schema with indexes shaped for the windowed aggregate queries.
    pub async fn setup_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS applications (
            id VARCHAR(64) PRIMARY KEY,
            name VARCHAR NOT NULL,
            description VARCHAR,
            domain VARCHAR NOT NULL,
            url VARCHAR,
            api_key VARCHAR(32) UNIQUE NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            tags TEXT[] NOT NULL DEFAULT '{}',
            metadata JSONB NOT NULL DEFAULT '{}',
            settings JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS hits (
            id UUID PRIMARY KEY,
            app_id VARCHAR(64) NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            session_id VARCHAR(64) NOT NULL,
            url VARCHAR NOT NULL,
            referrer VARCHAR,
            user_agent VARCHAR NOT NULL,
            ua_hash VARCHAR(16) NOT NULL,
            ip_address VARCHAR(45),
            device VARCHAR(16) NOT NULL,
            browser VARCHAR(16) NOT NULL,
            os VARCHAR(16) NOT NULL,
            is_bot BOOLEAN NOT NULL DEFAULT FALSE,
            screen_resolution VARCHAR(16),
            language VARCHAR(8),
            timezone VARCHAR(64),
            country VARCHAR(64),
            custom_params JSONB,
            timestamp TIMESTAMP WITH TIME ZONE NOT NULL
        );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id UUID PRIMARY KEY,
            app_id VARCHAR(64) NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            url VARCHAR NOT NULL,
            events TEXT[] NOT NULL,
            secret VARCHAR NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            custom_headers JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id UUID PRIMARY KEY,
            webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
            event VARCHAR(32) NOT NULL,
            outcome VARCHAR(16) NOT NULL,
            status INT,
            duration_ms BIGINT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hits_app_ts ON hits(app_id, timestamp DESC);")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hits_app_session ON hits(app_id, session_id);")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_webhooks_app ON webhooks(app_id);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deliveries_webhook ON webhook_deliveries(webhook_id, created_at DESC);",
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema setup complete");
        Ok(())
    }
}

fn row_to_application(row: &sqlx::postgres::PgRow) -> Result<Application, AppError> {
    let metadata: serde_json::Value = row.get("metadata");
    let settings: serde_json::Value = row.get("settings");
    Ok(Application {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        domain: row.get("domain"),
        url: row.get("url"),
        api_key: row.get("api_key"),
        active: row.get("active"),
        tags: row.get("tags"),
        metadata: serde_json::from_value(metadata)
            .map_err(|e| AppError::Internal(anyhow!("corrupt metadata column: {e}")))?,
        settings: serde_json::from_value(settings)
            .map_err(|e| AppError::Internal(anyhow!("corrupt settings column: {e}")))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_hit(row: &sqlx::postgres::PgRow) -> Result<TrackingHit, AppError> {
    fn parse<T: std::str::FromStr<Err = String>>(col: &str, v: String) -> Result<T, AppError> {
        v.parse()
            .map_err(|e: String| AppError::Internal(anyhow!("corrupt {col} column: {e}")))
    }
    let custom_params: Option<serde_json::Value> = row.get("custom_params");
    Ok(TrackingHit {
        id: row.get("id"),
        app_id: row.get("app_id"),
        session_id: row.get("session_id"),
        url: row.get("url"),
        referrer: row.get("referrer"),
        user_agent: row.get("user_agent"),
        ua_hash: row.get("ua_hash"),
        ip_address: row.get("ip_address"),
        device: parse("device", row.get("device"))?,
        browser: parse("browser", row.get("browser"))?,
        os: parse("os", row.get("os"))?,
        is_bot: row.get("is_bot"),
        screen_resolution: row.get("screen_resolution"),
        language: row.get("language"),
        timezone: row.get("timezone"),
        country: row.get("country"),
        custom_params: match custom_params {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| AppError::Internal(anyhow!("corrupt custom_params column: {e}")))?,
            None => None,
        },
        timestamp: row.get("timestamp"),
    })
}

pub struct PgApplicationRepo {
    pool: PgPool,
    metrics: Arc<AppMetrics>,
}

impl PgApplicationRepo {
    pub fn new(db: &Database, metrics: Arc<AppMetrics>) -> Self {
        Self {
            pool: db.pool().clone(),
            metrics,
        }
    }

    fn record(&self, query_type: &str, start: Instant, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.metrics
            .record_db_operation(query_type, result, start.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl ApplicationRepo for PgApplicationRepo {
    async fn insert(&self, app: &Application) -> Result<(), AppError> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO applications
                (id, name, description, domain, url, api_key, active, tags, metadata, settings, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&app.id)
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.domain)
        .bind(&app.url)
        .bind(&app.api_key)
        .bind(app.active)
        .bind(&app.tags)
        .bind(serde_json::to_value(&app.metadata).map_err(|e| AppError::Internal(e.into()))?)
        .bind(serde_json::to_value(&app.settings).map_err(|e| AppError::Internal(e.into()))?)
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&self.pool)
        .await;
        self.record("insert_application", start, res.is_ok());
        res?;
        Ok(())
    }

    async fn update(&self, app: &Application) -> Result<(), AppError> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            UPDATE applications SET
                name = $2, description = $3, domain = $4, url = $5, api_key = $6,
                active = $7, tags = $8, metadata = $9, settings = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(&app.id)
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.domain)
        .bind(&app.url)
        .bind(&app.api_key)
        .bind(app.active)
        .bind(&app.tags)
        .bind(serde_json::to_value(&app.metadata).map_err(|e| AppError::Internal(e.into()))?)
        .bind(serde_json::to_value(&app.settings).map_err(|e| AppError::Internal(e.into()))?)
        .bind(app.updated_at)
        .execute(&self.pool)
        .await;
        self.record("update_application", start, res.is_ok());
        if res?.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("application {} not found", app.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        let start = Instant::now();
        // Hits, webhooks and deliveries go with it via ON DELETE CASCADE
        let res = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        self.record("delete_application", start, res.is_ok());
        if res?.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("application {id} not found")));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Application>, AppError> {
        let start = Instant::now();
        let res = sqlx::query("SELECT * FROM applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        self.record("find_application", start, res.is_ok());
        res?.map(|row| row_to_application(&row)).transpose()
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Application>, AppError> {
        let start = Instant::now();
        let res = sqlx::query("SELECT * FROM applications WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await;
        self.record("find_application_by_key", start, res.is_ok());
        res?.map(|row| row_to_application(&row)).transpose()
    }

    async fn list(
        &self,
        page: PageRequest,
        active_only: bool,
        tag: Option<&str>,
    ) -> Result<Paginated<Application>, AppError> {
        let start = Instant::now();
        let total: Result<i64, _> = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM applications
            WHERE ($1 = FALSE OR active)
            AND ($2::VARCHAR IS NULL OR $2 = ANY(tags))
            "#,
        )
        .bind(active_only)
        .bind(tag)
        .fetch_one(&self.pool)
        .await;
        let rows = sqlx::query(
            r#"
            SELECT * FROM applications
            WHERE ($1 = FALSE OR active)
            AND ($2::VARCHAR IS NULL OR $2 = ANY(tags))
            ORDER BY created_at DESC, id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(active_only)
        .bind(tag)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await;
        self.record("list_applications", start, rows.is_ok());

        let items = rows?
            .iter()
            .map(row_to_application)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Paginated::new(items, page, total?))
    }

    async fn list_all_ids(&self) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query("SELECT id FROM applications")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }
}

pub struct PgHitRepo {
    pool: PgPool,
    metrics: Arc<AppMetrics>,
}

impl PgHitRepo {
    pub fn new(db: &Database, metrics: Arc<AppMetrics>) -> Self {
        Self {
            pool: db.pool().clone(),
            metrics,
        }
    }

    fn record(&self, query_type: &str, start: Instant, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.metrics
            .record_db_operation(query_type, result, start.elapsed().as_secs_f64());
    }

    async fn top_n(
        &self,
        app_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        column: &str,
    ) -> Result<Vec<TopEntry>, AppError> {
        // column is one of a fixed set picked by the caller, never input
        let sql = format!(
            r#"
            SELECT {column} AS label, COUNT(*) AS count
            FROM hits
            WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
            AND {column} IS NOT NULL AND {column} <> ''
            GROUP BY {column}
            ORDER BY count DESC, label ASC
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(app_id)
            .bind(start_ts)
            .bind(end_ts)
            .bind(TOP_N)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| TopEntry {
                label: row.get("label"),
                count: row.get("count"),
            })
            .collect())
    }
}

#[async_trait]
impl HitRepo for PgHitRepo {
    async fn insert(&self, hit: &TrackingHit) -> Result<(), AppError> {
        let n = self.insert_batch(std::slice::from_ref(hit)).await?;
        debug_assert_eq!(n, 1);
        Ok(())
    }

    /// Insert multiple hits in a single batch statement.
    async fn insert_batch(&self, hits: &[TrackingHit]) -> Result<u64, AppError> {
        if hits.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO hits (id, app_id, session_id, url, referrer, user_agent, ua_hash, \
             ip_address, device, browser, os, is_bot, screen_resolution, language, timezone, \
             country, custom_params, timestamp) ",
        );

        let mut encode_err = None;
        query_builder.push_values(hits, |mut b, hit| {
            let custom_params = match &hit.custom_params {
                Some(p) => match serde_json::to_value(p) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        encode_err = Some(e);
                        None
                    }
                },
                None => None,
            };
            b.push_bind(hit.id)
                .push_bind(&hit.app_id)
                .push_bind(&hit.session_id)
                .push_bind(&hit.url)
                .push_bind(&hit.referrer)
                .push_bind(&hit.user_agent)
                .push_bind(&hit.ua_hash)
                .push_bind(&hit.ip_address)
                .push_bind(hit.device.as_str())
                .push_bind(hit.browser.as_str())
                .push_bind(hit.os.as_str())
                .push_bind(hit.is_bot)
                .push_bind(&hit.screen_resolution)
                .push_bind(&hit.language)
                .push_bind(&hit.timezone)
                .push_bind(&hit.country)
                .push_bind(custom_params)
                .push_bind(hit.timestamp);
        });
        if let Some(e) = encode_err {
            return Err(AppError::Internal(e.into()));
        }

        let res = query_builder.build().execute(&self.pool).await;
        self.record("insert_hits", start, res.is_ok());
        Ok(res?.rows_affected())
    }

    async fn aggregate_window(
        &self,
        app_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        active_cutoff: DateTime<Utc>,
    ) -> Result<WindowAggregate, AppError> {
        let start = Instant::now();

        let totals = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_hits,
                COUNT(DISTINCT (ip_address, ua_hash, session_id)) AS unique_visitors
            FROM hits
            WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
            "#,
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_one(&self.pool)
        .await?;

        // Sessions materialize as groups of hits on session_id; a session
        // with a single page view is a bounce.
        let sessions = sqlx::query(
            r#"
            WITH sessions AS (
                SELECT session_id,
                       MIN(timestamp) AS started_at,
                       MAX(timestamp) AS last_activity,
                       COUNT(*) AS page_views
                FROM hits
                WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
                GROUP BY session_id
            )
            SELECT
                COUNT(*) AS unique_sessions,
                COUNT(*) FILTER (WHERE last_activity >= $4) AS active_sessions,
                COALESCE(AVG(EXTRACT(EPOCH FROM last_activity - started_at)), 0)::FLOAT8 AS avg_duration,
                COALESCE(AVG(page_views), 0)::FLOAT8 AS avg_pages,
                COALESCE(AVG(CASE WHEN page_views = 1 THEN 1.0 ELSE 0.0 END), 0)::FLOAT8 AS bounce_rate
            FROM sessions
            "#,
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .bind(active_cutoff)
        .fetch_one(&self.pool)
        .await?;

        // A visitor triple is returning when it also appears before the
        // window start.
        let visitors = sqlx::query(
            r#"
            WITH win AS (
                SELECT DISTINCT ip_address, ua_hash, session_id
                FROM hits
                WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
            )
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE EXISTS (
                    SELECT 1 FROM hits h
                    WHERE h.app_id = $1 AND h.timestamp < $2
                    AND h.ip_address IS NOT DISTINCT FROM win.ip_address
                    AND h.ua_hash = win.ua_hash
                    AND h.session_id = win.session_id
                )) AS returning
            FROM win
            "#,
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_one(&self.pool)
        .await?;

        let top_pages = self.top_n(app_id, start_ts, end_ts, "url").await?;
        let top_referrers = self.top_n(app_id, start_ts, end_ts, "referrer").await?;
        let top_user_agents = self.top_n(app_id, start_ts, end_ts, "user_agent").await?;
        let top_countries = self.top_n(app_id, start_ts, end_ts, "country").await?;

        self.record("aggregate_window", start, true);

        let visitor_total: i64 = visitors.get("total");
        let returning: i64 = visitors.get("returning");
        Ok(WindowAggregate {
            total_hits: totals.get("total_hits"),
            unique_visitors: totals.get("unique_visitors"),
            unique_sessions: sessions.get("unique_sessions"),
            active_sessions: sessions.get("active_sessions"),
            avg_session_duration_secs: sessions.get("avg_duration"),
            avg_pages_per_session: sessions.get("avg_pages"),
            bounce_rate: sessions.get("bounce_rate"),
            returning_visitors: returning,
            new_visitors: visitor_total - returning,
            top_pages,
            top_referrers,
            top_user_agents,
            top_countries,
        })
    }

    async fn bucket_counts(
        &self,
        app_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> Result<(i64, i64), AppError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_hits,
                COUNT(DISTINCT (ip_address, ua_hash, session_id)) AS unique_visitors
            FROM hits
            WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
            "#,
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("total_hits"), row.get("unique_visitors")))
    }

    async fn sessions_window(
        &self,
        app_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Paginated<Session>, AppError> {
        let start = Instant::now();
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT session_id) FROM hits WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3",
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            WITH ordered AS (
                SELECT *,
                       ROW_NUMBER() OVER (PARTITION BY session_id ORDER BY timestamp ASC, id ASC) AS rn_first,
                       ROW_NUMBER() OVER (PARTITION BY session_id ORDER BY timestamp DESC, id DESC) AS rn_last
                FROM hits
                WHERE app_id = $1 AND timestamp >= $2 AND timestamp < $3
            )
            SELECT s.session_id,
                   MIN(s.timestamp) AS started_at,
                   MAX(s.timestamp) AS last_activity,
                   COUNT(*) AS page_views,
                   MAX(s.url) FILTER (WHERE s.rn_first = 1) AS entry_url,
                   MAX(s.url) FILTER (WHERE s.rn_last = 1) AS exit_url,
                   MAX(s.device) FILTER (WHERE s.rn_first = 1) AS device,
                   MAX(s.browser) FILTER (WHERE s.rn_first = 1) AS browser,
                   MAX(s.os) FILTER (WHERE s.rn_first = 1) AS os,
                   MAX(s.country) FILTER (WHERE s.rn_first = 1) AS country
            FROM ordered s
            GROUP BY s.session_id
            ORDER BY last_activity DESC, s.session_id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(app_id)
        .bind(start_ts)
        .bind(end_ts)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await;
        self.record("sessions_window", start, rows.is_ok());

        let mut items = Vec::new();
        for row in rows? {
            let device: Option<String> = row.get("device");
            let browser: Option<String> = row.get("browser");
            let os: Option<String> = row.get("os");
            items.push(Session {
                session_id: row.get("session_id"),
                app_id: app_id.to_string(),
                started_at: row.get("started_at"),
                last_activity: row.get("last_activity"),
                ended_at: None,
                entry_url: row.get("entry_url"),
                exit_url: row.get("exit_url"),
                page_views: row.get("page_views"),
                device: device.and_then(|s| s.parse().ok()),
                browser: browser.and_then(|s| s.parse().ok()),
                os: os.and_then(|s| s.parse().ok()),
                country: row.get("country"),
            });
        }
        Ok(Paginated::new(items, page, total))
    }

    async fn purge_before(&self, app_id: &str, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let start = Instant::now();
        let res = sqlx::query("DELETE FROM hits WHERE app_id = $1 AND timestamp < $2")
            .bind(app_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await;
        self.record("purge_hits", start, res.is_ok());
        Ok(res?.rows_affected())
    }

    async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError> {
        let res = sqlx::query("DELETE FROM hits WHERE app_id = $1")
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

pub struct PgWebhookRepo {
    pool: PgPool,
    metrics: Arc<AppMetrics>,
}

impl PgWebhookRepo {
    pub fn new(db: &Database, metrics: Arc<AppMetrics>) -> Self {
        Self {
            pool: db.pool().clone(),
            metrics,
        }
    }

    fn record(&self, query_type: &str, start: Instant, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.metrics
            .record_db_operation(query_type, result, start.elapsed().as_secs_f64());
    }
}

fn row_to_webhook(row: &sqlx::postgres::PgRow) -> Result<Webhook, AppError> {
    let events: Vec<String> = row.get("events");
    let custom_headers: serde_json::Value = row.get("custom_headers");
    Ok(Webhook {
        id: row.get("id"),
        app_id: row.get("app_id"),
        url: row.get("url"),
        events: events
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(anyhow!("corrupt events column: {e}")))?,
        secret: row.get("secret"),
        active: row.get("active"),
        custom_headers: serde_json::from_value(custom_headers)
            .map_err(|e| AppError::Internal(anyhow!("corrupt custom_headers column: {e}")))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl WebhookRepo for PgWebhookRepo {
    async fn insert(&self, webhook: &Webhook) -> Result<(), AppError> {
        let start = Instant::now();
        let events: Vec<&str> = webhook.events.iter().map(|e| e.as_str()).collect();
        let res = sqlx::query(
            r#"
            INSERT INTO webhooks (id, app_id, url, events, secret, active, custom_headers, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(webhook.id)
        .bind(&webhook.app_id)
        .bind(&webhook.url)
        .bind(&events)
        .bind(&webhook.secret)
        .bind(webhook.active)
        .bind(serde_json::to_value(&webhook.custom_headers).map_err(|e| AppError::Internal(e.into()))?)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&self.pool)
        .await;
        self.record("insert_webhook", start, res.is_ok());
        res?;
        Ok(())
    }

    async fn update(&self, webhook: &Webhook) -> Result<(), AppError> {
        let start = Instant::now();
        let events: Vec<&str> = webhook.events.iter().map(|e| e.as_str()).collect();
        let res = sqlx::query(
            r#"
            UPDATE webhooks SET url = $3, events = $4, secret = $5, active = $6,
                custom_headers = $7, updated_at = $8
            WHERE app_id = $1 AND id = $2
            "#,
        )
        .bind(&webhook.app_id)
        .bind(webhook.id)
        .bind(&webhook.url)
        .bind(&events)
        .bind(&webhook.secret)
        .bind(webhook.active)
        .bind(serde_json::to_value(&webhook.custom_headers).map_err(|e| AppError::Internal(e.into()))?)
        .bind(webhook.updated_at)
        .execute(&self.pool)
        .await;
        self.record("update_webhook", start, res.is_ok());
        if res?.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("webhook {} not found", webhook.id)));
        }
        Ok(())
    }

    async fn delete(&self, app_id: &str, id: Uuid) -> Result<bool, AppError> {
        let res = sqlx::query("DELETE FROM webhooks WHERE app_id = $1 AND id = $2")
            .bind(app_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn find(&self, app_id: &str, id: Uuid) -> Result<Option<Webhook>, AppError> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE app_id = $1 AND id = $2")
            .bind(app_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_webhook(&r)).transpose()
    }

    async fn list_for_app(&self, app_id: &str) -> Result<Vec<Webhook>, AppError> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE app_id = $1 ORDER BY created_at ASC")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_webhook).collect()
    }

    async fn list_subscribed(
        &self,
        app_id: &str,
        event: WebhookEventKind,
    ) -> Result<Vec<Webhook>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM webhooks WHERE app_id = $1 AND active AND $2 = ANY(events) ORDER BY created_at ASC",
        )
        .bind(app_id)
        .bind(event.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_webhook).collect()
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), AppError> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, event, outcome, status, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.webhook_id)
        .bind(delivery.event.as_str())
        .bind(&delivery.outcome)
        .bind(delivery.status)
        .bind(delivery.duration_ms)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await;
        self.record("record_delivery", start, res.is_ok());
        res?;
        Ok(())
    }

    async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError> {
        let res = sqlx::query("DELETE FROM webhooks WHERE app_id = $1")
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

// ============================================================================
// In-memory fakes
// ============================================================================

pub mod memory {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    /// In-memory ApplicationRepo with the same uniqueness semantics as
    /// the Postgres schema (primary key on id, unique api_key).
    #[derive(Default)]
    pub struct MemApplicationRepo {
        apps: Mutex<Vec<Application>>,
    }

    impl MemApplicationRepo {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ApplicationRepo for MemApplicationRepo {
        async fn insert(&self, app: &Application) -> Result<(), AppError> {
            let mut apps = self.apps.lock().unwrap();
            if apps.iter().any(|a| a.id == app.id || a.api_key == app.api_key) {
                return Err(AppError::Conflict("duplicate application id or api key".to_string()));
            }
            apps.push(app.clone());
            Ok(())
        }

        async fn update(&self, app: &Application) -> Result<(), AppError> {
            let mut apps = self.apps.lock().unwrap();
            match apps.iter_mut().find(|a| a.id == app.id) {
                Some(slot) => {
                    *slot = app.clone();
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("application {} not found", app.id))),
            }
        }

        async fn delete(&self, id: &str) -> Result<(), AppError> {
            let mut apps = self.apps.lock().unwrap();
            let before = apps.len();
            apps.retain(|a| a.id != id);
            if apps.len() == before {
                return Err(AppError::NotFound(format!("application {id} not found")));
            }
            Ok(())
        }

        async fn find_by_id(&self, id: &str) -> Result<Option<Application>, AppError> {
            Ok(self.apps.lock().unwrap().iter().find(|a| a.id == id).cloned())
        }

        async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Application>, AppError> {
            Ok(self
                .apps
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.api_key == api_key)
                .cloned())
        }

        async fn list(
            &self,
            page: PageRequest,
            active_only: bool,
            tag: Option<&str>,
        ) -> Result<Paginated<Application>, AppError> {
            let apps = self.apps.lock().unwrap();
            let mut matched: Vec<Application> = apps
                .iter()
                .filter(|a| !active_only || a.active)
                .filter(|a| tag.map_or(true, |t| a.tags.iter().any(|x| x == t)))
                .cloned()
                .collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            let total = matched.len() as i64;
            let items = matched
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.limit() as usize)
                .collect();
            Ok(Paginated::new(items, page, total))
        }

        async fn list_all_ids(&self) -> Result<Vec<String>, AppError> {
            Ok(self.apps.lock().unwrap().iter().map(|a| a.id.clone()).collect())
        }
    }

    /// In-memory HitRepo computing the same aggregates as the SQL.
    #[derive(Default)]
    pub struct MemHitRepo {
        hits: Mutex<Vec<TrackingHit>>,
    }

    impl MemHitRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn all(&self) -> Vec<TrackingHit> {
            self.hits.lock().unwrap().clone()
        }

        fn window(
            &self,
            app_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Vec<TrackingHit> {
            self.hits
                .lock()
                .unwrap()
                .iter()
                .filter(|h| h.app_id == app_id && h.timestamp >= start && h.timestamp < end)
                .cloned()
                .collect()
        }

        fn top_n_by<F>(hits: &[TrackingHit], f: F) -> Vec<TopEntry>
        where
            F: Fn(&TrackingHit) -> Option<String>,
        {
            let mut counts: HashMap<String, i64> = HashMap::new();
            for hit in hits {
                if let Some(label) = f(hit) {
                    if !label.is_empty() {
                        *counts.entry(label).or_insert(0) += 1;
                    }
                }
            }
            let mut entries: Vec<TopEntry> = counts
                .into_iter()
                .map(|(label, count)| TopEntry { label, count })
                .collect();
            entries.sort_by(|a, b| b.count.cmp(&a.count).then(a.label.cmp(&b.label)));
            entries.truncate(TOP_N as usize);
            entries
        }
    }

    fn visitor_triple(hit: &TrackingHit) -> (Option<String>, String, String) {
        (
            hit.ip_address.clone(),
            hit.ua_hash.clone(),
            hit.session_id.clone(),
        )
    }

    #[async_trait]
    impl HitRepo for MemHitRepo {
        async fn insert(&self, hit: &TrackingHit) -> Result<(), AppError> {
            self.hits.lock().unwrap().push(hit.clone());
            Ok(())
        }

        async fn insert_batch(&self, hits: &[TrackingHit]) -> Result<u64, AppError> {
            self.hits.lock().unwrap().extend_from_slice(hits);
            Ok(hits.len() as u64)
        }

        async fn aggregate_window(
            &self,
            app_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            active_cutoff: DateTime<Utc>,
        ) -> Result<WindowAggregate, AppError> {
            let hits = self.window(app_id, start, end);
            let total_hits = hits.len() as i64;

            let visitors: BTreeSet<_> = hits.iter().map(visitor_triple).collect();
            let unique_visitors = visitors.len() as i64;

            // Group into sessions
            let mut sessions: HashMap<String, (DateTime<Utc>, DateTime<Utc>, i64)> = HashMap::new();
            for hit in &hits {
                let entry = sessions
                    .entry(hit.session_id.clone())
                    .or_insert((hit.timestamp, hit.timestamp, 0));
                entry.0 = entry.0.min(hit.timestamp);
                entry.1 = entry.1.max(hit.timestamp);
                entry.2 += 1;
            }
            let unique_sessions = sessions.len() as i64;
            let active_sessions = sessions
                .values()
                .filter(|(_, last, _)| *last >= active_cutoff)
                .count() as i64;
            let (avg_duration, avg_pages, bounce_rate) = if unique_sessions > 0 {
                let n = unique_sessions as f64;
                let dur: f64 = sessions
                    .values()
                    .map(|(s, e, _)| (*e - *s).num_milliseconds() as f64 / 1000.0)
                    .sum();
                let pages: i64 = sessions.values().map(|(_, _, p)| p).sum();
                let bounces = sessions.values().filter(|(_, _, p)| *p == 1).count() as f64;
                (dur / n, pages as f64 / n, bounces / n)
            } else {
                (0.0, 0.0, 0.0)
            };

            let prior: BTreeSet<_> = self
                .hits
                .lock()
                .unwrap()
                .iter()
                .filter(|h| h.app_id == app_id && h.timestamp < start)
                .map(visitor_triple)
                .collect();
            let returning_visitors =
                visitors.iter().filter(|v| prior.contains(*v)).count() as i64;

            Ok(WindowAggregate {
                total_hits,
                unique_visitors,
                unique_sessions,
                active_sessions,
                avg_session_duration_secs: avg_duration,
                avg_pages_per_session: avg_pages,
                bounce_rate,
                returning_visitors,
                new_visitors: unique_visitors - returning_visitors,
                top_pages: Self::top_n_by(&hits, |h| Some(h.url.clone())),
                top_referrers: Self::top_n_by(&hits, |h| h.referrer.clone()),
                top_user_agents: Self::top_n_by(&hits, |h| Some(h.user_agent.clone())),
                top_countries: Self::top_n_by(&hits, |h| h.country.clone()),
            })
        }

        async fn bucket_counts(
            &self,
            app_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<(i64, i64), AppError> {
            let hits = self.window(app_id, start, end);
            let visitors: BTreeSet<_> = hits.iter().map(visitor_triple).collect();
            Ok((hits.len() as i64, visitors.len() as i64))
        }

        async fn sessions_window(
            &self,
            app_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            page: PageRequest,
        ) -> Result<Paginated<Session>, AppError> {
            let mut hits = self.window(app_id, start, end);
            hits.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

            let mut grouped: HashMap<String, Vec<&TrackingHit>> = HashMap::new();
            for hit in &hits {
                grouped.entry(hit.session_id.clone()).or_default().push(hit);
            }
            let mut sessions: Vec<Session> = grouped
                .into_iter()
                .map(|(session_id, run)| {
                    let first = run.first().unwrap();
                    let last = run.last().unwrap();
                    Session {
                        session_id,
                        app_id: app_id.to_string(),
                        started_at: first.timestamp,
                        last_activity: last.timestamp,
                        ended_at: None,
                        entry_url: first.url.clone(),
                        exit_url: last.url.clone(),
                        page_views: run.len() as i64,
                        device: Some(first.device),
                        browser: Some(first.browser),
                        os: Some(first.os),
                        country: first.country.clone(),
                    }
                })
                .collect();
            sessions.sort_by(|a, b| {
                b.last_activity
                    .cmp(&a.last_activity)
                    .then(a.session_id.cmp(&b.session_id))
            });
            let total = sessions.len() as i64;
            let items = sessions
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.limit() as usize)
                .collect();
            Ok(Paginated::new(items, page, total))
        }

        async fn purge_before(
            &self,
            app_id: &str,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, AppError> {
            let mut hits = self.hits.lock().unwrap();
            let before = hits.len();
            hits.retain(|h| !(h.app_id == app_id && h.timestamp < cutoff));
            Ok((before - hits.len()) as u64)
        }

        async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError> {
            let mut hits = self.hits.lock().unwrap();
            let before = hits.len();
            hits.retain(|h| h.app_id != app_id);
            Ok((before - hits.len()) as u64)
        }
    }

    /// In-memory WebhookRepo, deliveries included.
    #[derive(Default)]
    pub struct MemWebhookRepo {
        webhooks: Mutex<Vec<Webhook>>,
        deliveries: Mutex<Vec<WebhookDelivery>>,
    }

    impl MemWebhookRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn deliveries(&self) -> Vec<WebhookDelivery> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookRepo for MemWebhookRepo {
        async fn insert(&self, webhook: &Webhook) -> Result<(), AppError> {
            let mut hooks = self.webhooks.lock().unwrap();
            if hooks.iter().any(|w| w.id == webhook.id) {
                return Err(AppError::Conflict("duplicate webhook id".to_string()));
            }
            hooks.push(webhook.clone());
            Ok(())
        }

        async fn update(&self, webhook: &Webhook) -> Result<(), AppError> {
            let mut hooks = self.webhooks.lock().unwrap();
            match hooks
                .iter_mut()
                .find(|w| w.app_id == webhook.app_id && w.id == webhook.id)
            {
                Some(slot) => {
                    *slot = webhook.clone();
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("webhook {} not found", webhook.id))),
            }
        }

        async fn delete(&self, app_id: &str, id: Uuid) -> Result<bool, AppError> {
            let mut hooks = self.webhooks.lock().unwrap();
            let before = hooks.len();
            hooks.retain(|w| !(w.app_id == app_id && w.id == id));
            Ok(hooks.len() != before)
        }

        async fn find(&self, app_id: &str, id: Uuid) -> Result<Option<Webhook>, AppError> {
            Ok(self
                .webhooks
                .lock()
                .unwrap()
                .iter()
                .find(|w| w.app_id == app_id && w.id == id)
                .cloned())
        }

        async fn list_for_app(&self, app_id: &str) -> Result<Vec<Webhook>, AppError> {
            let mut hooks: Vec<Webhook> = self
                .webhooks
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w.app_id == app_id)
                .cloned()
                .collect();
            hooks.sort_by_key(|w| w.created_at);
            Ok(hooks)
        }

        async fn list_subscribed(
            &self,
            app_id: &str,
            event: WebhookEventKind,
        ) -> Result<Vec<Webhook>, AppError> {
            let mut hooks: Vec<Webhook> = self
                .webhooks
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w.app_id == app_id && w.active && w.events.contains(&event))
                .cloned()
                .collect();
            hooks.sort_by_key(|w| w.created_at);
            Ok(hooks)
        }

        async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), AppError> {
            self.deliveries.lock().unwrap().push(delivery.clone());
            Ok(())
        }

        async fn delete_for_app(&self, app_id: &str) -> Result<u64, AppError> {
            let mut hooks = self.webhooks.lock().unwrap();
            let before = hooks.len();
            hooks.retain(|w| w.app_id != app_id);
            Ok((before - hooks.len()) as u64)
        }
    }
}
