// Statistics Service
//
// Period-windowed aggregates over hits, memoized in the cache under
// `stats:<tenant>:<period>:<bucket>` with per-period TTLs. Windows are
// calendar-aligned in UTC except realtime, which is the rolling last
// hour labelled by its end.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{keys, Cache};
use crate::error::AppError;
use crate::models::{Application, StatsPeriod, StatsSnapshot, SubBucket, WebhookEventKind};
use crate::repo::HitRepo;
use crate::services::webhook::WebhookService;

/// One period window: half-open `[start, end)` plus its cache label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: String,
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc()
}

fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month exists")
}

fn next_month_start(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month exists")
}

fn iso_week_label(date: NaiveDate) -> String {
    date.format("%G-W%V").to_string()
}

/// Compute the window containing `now` for one period.
pub fn window_for(period: StatsPeriod, now: DateTime<Utc>) -> Window {
    match period {
        StatsPeriod::Realtime => {
            let end = now;
            Window {
                start: end - Duration::hours(1),
                end,
                bucket: end.format("%Y-%m-%dT%H").to_string(),
            }
        }
        StatsPeriod::Daily => {
            let start = midnight(now.date_naive());
            Window {
                start,
                end: start + Duration::days(1),
                bucket: now.format("%Y-%m-%d").to_string(),
            }
        }
        StatsPeriod::Weekly => {
            let monday =
                now.date_naive() - Duration::days(i64::from(now.weekday().num_days_from_monday()));
            let start = midnight(monday);
            Window {
                start,
                end: start + Duration::days(7),
                bucket: iso_week_label(monday),
            }
        }
        StatsPeriod::Monthly => {
            let first = month_start(now.date_naive());
            Window {
                start: midnight(first),
                end: midnight(next_month_start(first)),
                bucket: now.format("%Y-%m").to_string(),
            }
        }
    }
}

/// Sub-bucket boundaries for one window: 24 hours of a day, 7 days of a
/// week, Monday-aligned weeks clipped to a month. Realtime has none.
pub fn sub_windows(period: StatsPeriod, window: &Window) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
    match period {
        StatsPeriod::Realtime => Vec::new(),
        StatsPeriod::Daily => (0..24)
            .map(|h| {
                let start = window.start + Duration::hours(h);
                (format!("{:02}:00", h), start, start + Duration::hours(1))
            })
            .collect(),
        StatsPeriod::Weekly => (0..7)
            .map(|d| {
                let start = window.start + Duration::days(d);
                (
                    start.format("%Y-%m-%d").to_string(),
                    start,
                    start + Duration::days(1),
                )
            })
            .collect(),
        StatsPeriod::Monthly => {
            let mut out = Vec::new();
            let mut cursor = window.start;
            while cursor < window.end {
                let monday = cursor.date_naive()
                    - Duration::days(i64::from(cursor.weekday().num_days_from_monday()));
                let next = midnight(monday + Duration::days(7)).min(window.end);
                out.push((iso_week_label(monday), cursor, next));
                cursor = next;
            }
            out
        }
    }
}

pub struct StatisticsService {
    hits: Arc<dyn HitRepo>,
    cache: Cache,
    webhooks: Arc<WebhookService>,
}

impl StatisticsService {
    pub fn new(hits: Arc<dyn HitRepo>, cache: Cache, webhooks: Arc<WebhookService>) -> Self {
        Self {
            hits,
            cache,
            webhooks,
        }
    }

    /// Return the snapshot for the window containing now, computing and
    /// memoizing it on miss.
    pub async fn snapshot(
        &self,
        app: &Application,
        period: StatsPeriod,
    ) -> Result<StatsSnapshot, AppError> {
        let now = Utc::now();
        let window = window_for(period, now);
        let key = keys::stats(&app.id, period, &window.bucket);

        match self.cache.get_json::<StatsSnapshot>(&key).await {
            Ok(Some(snapshot)) => {
                debug!("stats cache hit for {key}");
                return Ok(snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!("stats cache read failed for {key}: {e}"),
        }

        let snapshot = self.compute(app, period, &window, now).await?;
        if let Err(e) = self
            .cache
            .put_json(&key, &snapshot, period.cache_ttl_secs())
            .await
        {
            warn!("stats cache write failed for {key}: {e}");
        }

        let webhooks = Arc::clone(&self.webhooks);
        let app_id = app.id.clone();
        let body = serde_json::json!({
            "period": period,
            "bucket": snapshot.bucket,
            "total_hits": snapshot.total_hits,
            "unique_visitors": snapshot.unique_visitors,
        });
        tokio::spawn(async move {
            webhooks
                .dispatch(&app_id, WebhookEventKind::StatisticsUpdated, body)
                .await;
        });

        Ok(snapshot)
    }

    async fn compute(
        &self,
        app: &Application,
        period: StatsPeriod,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Result<StatsSnapshot, AppError> {
        let active_cutoff = now - Duration::seconds(i64::from(app.settings.session_timeout_secs));
        let agg = self
            .hits
            .aggregate_window(&app.id, window.start, window.end, active_cutoff)
            .await?;

        let mut sub_buckets = Vec::new();
        for (label, start, end) in sub_windows(period, window) {
            let (total_hits, unique_visitors) =
                self.hits.bucket_counts(&app.id, start, end).await?;
            sub_buckets.push(SubBucket {
                label,
                start,
                end,
                total_hits,
                unique_visitors,
            });
        }

        Ok(StatsSnapshot {
            app_id: app.id.clone(),
            period,
            bucket: window.bucket.clone(),
            start: window.start,
            end: window.end,
            total_hits: agg.total_hits,
            unique_visitors: agg.unique_visitors,
            unique_sessions: agg.unique_sessions,
            active_sessions: agg.active_sessions,
            avg_session_duration_secs: agg.avg_session_duration_secs,
            avg_pages_per_session: agg.avg_pages_per_session,
            bounce_rate: agg.bounce_rate,
            returning_visitors: agg.returning_visitors,
            new_visitors: agg.new_visitors,
            top_pages: agg.top_pages,
            top_referrers: agg.top_referrers,
            top_user_agents: agg.top_user_agents,
            top_countries: agg.top_countries,
            sub_buckets,
        })
    }

    /// Drop every memoized snapshot for one tenant.
    pub async fn clear_cache(&self, app_id: &str) -> Result<u64, AppError> {
        self.cache
            .delete_pattern(&keys::stats_pattern(app_id))
            .await
            .map_err(AppError::Internal)
    }
}
