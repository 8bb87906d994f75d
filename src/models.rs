// Data Models
//
// Entities for tenants (applications), tracking hits, derived sessions,
// webhook subscriptions, and the statistics views computed from hits.
// All wire field names are snake_case; timestamps are RFC-3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant settings with the numeric ranges enforced by the validator:
/// session timeout 60..=86400 s, retention 1..=3650 days,
/// max custom params 1..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    pub session_timeout_secs: u32,
    pub retention_days: u32,
    pub max_custom_params: u32,
    pub bot_filter_enabled: bool,
    pub webhook_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Privacy toggle: store (anonymized) IPs at all
    pub collect_ip: bool,
    /// Privacy toggle: store raw user-agent strings
    pub collect_user_agent: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_ips: Vec<String>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            session_timeout_secs: 1800,
            retention_days: 365,
            max_custom_params: 10,
            bot_filter_enabled: true,
            webhook_enabled: false,
            webhook_url: None,
            collect_ip: true,
            collect_user_agent: true,
            allowed_domains: Vec::new(),
            blocked_ips: Vec::new(),
        }
    }
}

/// A tenant application. The id is externally referenced and stable:
/// either a UUID or up to 50 chars of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Opaque 32-char token, unique across tenants
    pub api_key: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub settings: ApplicationSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Free-form custom parameter value. A tagged sum rather than raw
/// serde_json::Value so the validator can enforce depth and size bounds
/// on a closed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<CustomValue>),
    Object(BTreeMap<String, CustomValue>),
}

pub type CustomParams = BTreeMap<String, CustomValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(DeviceClass::Mobile),
            "tablet" => Ok(DeviceClass::Tablet),
            "desktop" => Ok(DeviceClass::Desktop),
            other => Err(format!("unknown device class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Edge,
    Opera,
    Chrome,
    Firefox,
    Safari,
    Other,
}

impl BrowserFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserFamily::Edge => "edge",
            BrowserFamily::Opera => "opera",
            BrowserFamily::Chrome => "chrome",
            BrowserFamily::Firefox => "firefox",
            BrowserFamily::Safari => "safari",
            BrowserFamily::Other => "other",
        }
    }
}

impl FromStr for BrowserFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge" => Ok(BrowserFamily::Edge),
            "opera" => Ok(BrowserFamily::Opera),
            "chrome" => Ok(BrowserFamily::Chrome),
            "firefox" => Ok(BrowserFamily::Firefox),
            "safari" => Ok(BrowserFamily::Safari),
            "other" => Ok(BrowserFamily::Other),
            other => Err(format!("unknown browser family: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Ios,
    Android,
    Windows,
    Macos,
    Linux,
    Other,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ios => "ios",
            OsFamily::Android => "android",
            OsFamily::Windows => "windows",
            OsFamily::Macos => "macos",
            OsFamily::Linux => "linux",
            OsFamily::Other => "other",
        }
    }
}

impl FromStr for OsFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(OsFamily::Ios),
            "android" => Ok(OsFamily::Android),
            "windows" => Ok(OsFamily::Windows),
            "macos" => Ok(OsFamily::Macos),
            "linux" => Ok(OsFamily::Linux),
            "other" => Ok(OsFamily::Other),
            other => Err(format!("unknown os family: {other}")),
        }
    }
}

/// One recorded access event. Created by ingest, immutable thereafter.
/// The stored ip_address is always already anonymized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingHit {
    pub id: Uuid,
    pub app_id: String,
    pub session_id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub user_agent: String,
    /// First 16 hex chars of SHA-256 of the user agent; used with the
    /// anonymized IP and session id for unique-visitor counting
    pub ua_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub device: DeviceClass,
    pub browser: BrowserFamily,
    pub os: OsFamily,
    pub is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<CustomParams>,
    pub timestamp: DateTime<Utc>,
}

/// A contiguous run of hits from one visitor, materialized on read by
/// grouping hits on session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub app_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub entry_url: String,
    pub exit_url: String,
    pub page_views: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserFamily>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsFamily>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Session {
    /// A session expires once inactivity exceeds the tenant's timeout.
    pub fn is_expired(&self, now: DateTime<Utc>, session_timeout_secs: u32) -> bool {
        (now - self.last_activity).num_seconds() > i64::from(session_timeout_secs)
    }
}

/// Closed set of webhook event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    PageView,
    SessionStarted,
    SessionEnded,
    StatisticsUpdated,
    ApplicationEvent,
    Test,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventKind::PageView => "page_view",
            WebhookEventKind::SessionStarted => "session_started",
            WebhookEventKind::SessionEnded => "session_ended",
            WebhookEventKind::StatisticsUpdated => "statistics_updated",
            WebhookEventKind::ApplicationEvent => "application_event",
            WebhookEventKind::Test => "test",
        }
    }
}

impl FromStr for WebhookEventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page_view" => Ok(WebhookEventKind::PageView),
            "session_started" => Ok(WebhookEventKind::SessionStarted),
            "session_ended" => Ok(WebhookEventKind::SessionEnded),
            "statistics_updated" => Ok(WebhookEventKind::StatisticsUpdated),
            "application_event" => Ok(WebhookEventKind::ApplicationEvent),
            "test" => Ok(WebhookEventKind::Test),
            other => Err(format!("unknown webhook event kind: {other}")),
        }
    }
}

/// A webhook subscription owned by one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub app_id: String,
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    /// Shared secret used to key the HMAC-SHA-256 delivery signature
    pub secret: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed payload envelope carried by every webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: WebhookEventKind,
    pub timestamp: DateTime<Utc>,
    pub tenant: String,
    pub body: serde_json::Value,
}

/// One row of the append-only per-subscription delivery audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: WebhookEventKind,
    /// "success", "error", or "rate_limited"
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregation period; each has its own window shape and cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
    Realtime,
    Daily,
    Weekly,
    Monthly,
}

impl StatsPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsPeriod::Realtime => "realtime",
            StatsPeriod::Daily => "daily",
            StatsPeriod::Weekly => "weekly",
            StatsPeriod::Monthly => "monthly",
        }
    }

    /// Cache TTL: realtime 5 min, daily 1 h, weekly 6 h, monthly 24 h.
    pub fn cache_ttl_secs(&self) -> u64 {
        match self {
            StatsPeriod::Realtime => 300,
            StatsPeriod::Daily => 3600,
            StatsPeriod::Weekly => 21600,
            StatsPeriod::Monthly => 86400,
        }
    }
}

impl FromStr for StatsPeriod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(StatsPeriod::Realtime),
            "daily" => Ok(StatsPeriod::Daily),
            "weekly" => Ok(StatsPeriod::Weekly),
            "monthly" => Ok(StatsPeriod::Monthly),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

impl fmt::Display for StatsPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked label/count pair for top-N lists. Ordered by count descending,
/// then label ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub label: String,
    pub count: i64,
}

/// One sub-bucket of a period window (hour of a day, day of a week,
/// Monday-aligned week of a month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBucket {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_hits: i64,
    pub unique_visitors: i64,
}

/// Per-tenant, per-period aggregate snapshot. Derived from hits and
/// cached under `stats:<tenant>:<period>:<bucket>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub app_id: String,
    pub period: StatsPeriod,
    pub bucket: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_hits: i64,
    pub unique_visitors: i64,
    pub unique_sessions: i64,
    pub active_sessions: i64,
    pub avg_session_duration_secs: f64,
    pub avg_pages_per_session: f64,
    pub bounce_rate: f64,
    pub returning_visitors: i64,
    pub new_visitors: i64,
    pub top_pages: Vec<TopEntry>,
    pub top_referrers: Vec<TopEntry>,
    pub top_user_agents: Vec<TopEntry>,
    pub top_countries: Vec<TopEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_buckets: Vec<SubBucket>,
}

/// Raw aggregate numbers from the repository before memoization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub total_hits: i64,
    pub unique_visitors: i64,
    pub unique_sessions: i64,
    pub active_sessions: i64,
    pub avg_session_duration_secs: f64,
    pub avg_pages_per_session: f64,
    pub bounce_rate: f64,
    pub returning_visitors: i64,
    pub new_visitors: i64,
    pub top_pages: Vec<TopEntry>,
    pub top_referrers: Vec<TopEntry>,
    pub top_user_agents: Vec<TopEntry>,
    pub top_countries: Vec<TopEntry>,
}

/// Pagination input. Out-of-range values clamp instead of erroring:
/// page < 1 becomes 1, page_size outside 1..=100 becomes the default 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn clamped(page: Option<u32>, page_size: Option<u32>) -> Self {
        let page = match page {
            Some(p) if p >= 1 => p,
            _ => 1,
        };
        let page_size = match page_size {
            Some(s) if (1..=MAX_PAGE_SIZE).contains(&s) => s,
            _ => DEFAULT_PAGE_SIZE,
        };
        Self { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

/// Paged response envelope: `total_pages = ceil(total / page_size)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, req: PageRequest, total: i64) -> Self {
        let page_size = i64::from(req.page_size);
        let total_pages = (total + page_size - 1) / page_size;
        Self {
            items,
            page: req.page,
            page_size: req.page_size,
            total,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps_instead_of_erroring() {
        let req = PageRequest::clamped(Some(0), Some(500));
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, DEFAULT_PAGE_SIZE);

        let req = PageRequest::clamped(None, Some(0));
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, DEFAULT_PAGE_SIZE);

        let req = PageRequest::clamped(Some(3), Some(100));
        assert_eq!(req.page, 3);
        assert_eq!(req.page_size, 100);
        assert_eq!(req.offset(), 200);
    }

    #[test]
    fn total_pages_is_ceiling_division() {
        let p = Paginated::new(vec![1, 2, 3], PageRequest::clamped(Some(1), Some(10)), 21);
        assert_eq!(p.total_pages, 3);
        let p = Paginated::new(Vec::<i32>::new(), PageRequest::clamped(Some(1), Some(10)), 20);
        assert_eq!(p.total_pages, 2);
        let p = Paginated::new(Vec::<i32>::new(), PageRequest::clamped(Some(1), Some(10)), 0);
        assert_eq!(p.total_pages, 0);
    }

    #[test]
    fn webhook_event_kind_round_trips() {
        for kind in [
            WebhookEventKind::PageView,
            WebhookEventKind::SessionStarted,
            WebhookEventKind::SessionEnded,
            WebhookEventKind::StatisticsUpdated,
            WebhookEventKind::ApplicationEvent,
            WebhookEventKind::Test,
        ] {
            assert_eq!(kind.as_str().parse::<WebhookEventKind>().unwrap(), kind);
        }
        assert!("page_viewed".parse::<WebhookEventKind>().is_err());
    }

    #[test]
    fn custom_value_decodes_heterogeneous_trees() {
        let json = r#"{"plan":"pro","count":3,"flags":[true,null],"meta":{"a":"b"}}"#;
        let params: CustomParams = serde_json::from_str(json).unwrap();
        assert_eq!(params["plan"], CustomValue::String("pro".into()));
        assert_eq!(params["count"], CustomValue::Number(3.0));
        assert!(matches!(params["flags"], CustomValue::Array(_)));
        assert!(matches!(params["meta"], CustomValue::Object(_)));
    }

    #[test]
    fn entity_json_round_trip() {
        let hit = TrackingHit {
            id: Uuid::new_v4(),
            app_id: "app-1".into(),
            session_id: "s-1".into(),
            url: "https://example.com/a".into(),
            referrer: Some("https://ref.example".into()),
            user_agent: "Mozilla/5.0 Chrome/120".into(),
            ua_hash: "0011223344556677".into(),
            ip_address: Some("203.0.113.0".into()),
            device: DeviceClass::Desktop,
            browser: BrowserFamily::Chrome,
            os: OsFamily::Linux,
            is_bot: false,
            screen_resolution: Some("1920x1080".into()),
            language: Some("en-US".into()),
            timezone: Some("Europe/Berlin".into()),
            country: None,
            custom_params: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&hit).unwrap();
        let back: TrackingHit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hit);
    }

    #[test]
    fn session_expiry_uses_tenant_timeout() {
        let now = Utc::now();
        let s = Session {
            session_id: "s".into(),
            app_id: "a".into(),
            started_at: now - chrono::Duration::seconds(600),
            last_activity: now - chrono::Duration::seconds(120),
            ended_at: None,
            entry_url: "/".into(),
            exit_url: "/x".into(),
            page_views: 3,
            device: None,
            browser: None,
            os: None,
            country: None,
        };
        assert!(s.is_expired(now, 60));
        assert!(!s.is_expired(now, 300));
    }

    #[test]
    fn period_ttls_match_policy() {
        assert_eq!(StatsPeriod::Realtime.cache_ttl_secs(), 300);
        assert_eq!(StatsPeriod::Daily.cache_ttl_secs(), 3600);
        assert_eq!(StatsPeriod::Weekly.cache_ttl_secs(), 21600);
        assert_eq!(StatsPeriod::Monthly.cache_ttl_secs(), 86400);
    }
}
