// Entity Validators
//
// Per-entity invariant checks producing aggregated error reports: every
// violated rule is collected, one human-readable line each, and surfaced
// as a single VALIDATION_ERROR with details.

use chrono::{DateTime, Duration, Utc};
use url::Url;

use crate::error::AppError;
use crate::models::{Application, CustomParams, CustomValue, Session, TrackingHit, Webhook};

/// Collects rule violations; empty report means the entity is valid.
#[derive(Debug, Default)]
pub struct Report {
    violations: Vec<String>,
}

impl Report {
    pub fn fail(&mut self, msg: impl Into<String>) {
        self.violations.push(msg.into());
    }

    pub fn check(&mut self, ok: bool, msg: impl Into<String>) {
        if !ok {
            self.fail(msg);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<(), AppError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self.violations))
        }
    }
}

fn is_tag_charset(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Syntactic domain check: ≤253 chars, dot-separated labels of 1..=63
/// alphanumeric-or-hyphen chars, no label starting or ending with a
/// hyphen.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

fn is_http_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

/// Screen resolution must match `\d+x\d+`.
fn is_screen_resolution(s: &str) -> bool {
    match s.split_once('x') {
        Some((w, h)) => {
            !w.is_empty()
                && !h.is_empty()
                && w.bytes().all(|b| b.is_ascii_digit())
                && h.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Language must match `[a-z]{2}(-[A-Z]{2})?`.
fn is_language_tag(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.len() {
        2 => bytes.iter().all(|b| b.is_ascii_lowercase()),
        5 => {
            bytes[0].is_ascii_lowercase()
                && bytes[1].is_ascii_lowercase()
                && bytes[2] == b'-'
                && bytes[3].is_ascii_uppercase()
                && bytes[4].is_ascii_uppercase()
        }
        _ => false,
    }
}

fn is_known_timezone(s: &str) -> bool {
    s.parse::<chrono_tz::Tz>().is_ok()
}

const UA_MARKERS: &[&str] = &[
    "mozilla", "chrome", "safari", "firefox", "edge", "opera", "bot", "crawler", "spider",
];

/// Tenant validator, shared by create and update. On update the id must
/// already be present.
pub fn validate_application(app: &Application, is_update: bool) -> Result<(), AppError> {
    let mut report = Report::default();

    if is_update {
        report.check(!app.id.is_empty(), "id is required on update");
    }
    if !app.id.is_empty() {
        report.check(
            crate::ident::app_id_is_well_formed(&app.id),
            "id must be a UUID or up to 50 chars of [A-Za-z0-9_-]",
        );
    }

    report.check(!app.name.is_empty(), "name is required");
    report.check(app.name.len() <= 100, "name must be at most 100 chars");

    if let Some(desc) = &app.description {
        report.check(desc.len() <= 500, "description must be at most 500 chars");
    }

    report.check(!app.domain.is_empty(), "domain is required");
    if !app.domain.is_empty() {
        report.check(
            is_valid_domain(&app.domain),
            format!("domain '{}' is not a valid domain name", app.domain),
        );
    }

    if let Some(url) = &app.url {
        report.check(url.len() <= 2048, "url must be at most 2048 chars");
        report.check(
            is_http_url(url),
            "url must be http(s) with a non-empty host",
        );
    }

    report.check(app.tags.len() <= 20, "at most 20 tags allowed");
    for tag in &app.tags {
        report.check(
            tag.len() <= 50 && is_tag_charset(tag),
            format!("tag '{tag}' must be 1-50 chars of [A-Za-z0-9_-]"),
        );
    }

    report.check(app.metadata.len() <= 50, "at most 50 metadata entries allowed");
    for (key, value) in &app.metadata {
        report.check(
            key.len() <= 100 && is_tag_charset(key),
            format!("metadata key '{key}' must be 1-100 chars of [A-Za-z0-9_-]"),
        );
        report.check(
            value.len() <= 1000,
            format!("metadata value for '{key}' must be at most 1000 chars"),
        );
    }

    let s = &app.settings;
    report.check(
        (60..=86400).contains(&s.session_timeout_secs),
        "session timeout must be between 60 and 86400 seconds",
    );
    report.check(
        (1..=3650).contains(&s.retention_days),
        "retention must be between 1 and 3650 days",
    );
    report.check(
        (1..=100).contains(&s.max_custom_params),
        "max custom params must be between 1 and 100",
    );
    if s.webhook_enabled {
        match &s.webhook_url {
            Some(u) => report.check(
                is_http_url(u),
                "webhook url must be http(s) with a non-empty host",
            ),
            None => report.fail("webhook url is required when webhooks are enabled"),
        }
    }

    report.into_result()
}

/// Custom-params bounds: ≤max_keys top-level keys, strings ≤1000 chars,
/// arrays ≤100 items, nested objects ≤50 keys, one level of container
/// recursion.
pub fn validate_custom_params(params: &CustomParams, max_keys: usize, report: &mut Report) {
    report.check(
        params.len() <= max_keys,
        format!("custom_params allows at most {max_keys} top-level keys"),
    );
    for (key, value) in params {
        validate_custom_value(key, value, 0, report);
    }
}

fn validate_custom_value(key: &str, value: &CustomValue, depth: u8, report: &mut Report) {
    match value {
        CustomValue::Null | CustomValue::Bool(_) | CustomValue::Number(_) => {}
        CustomValue::String(s) => {
            report.check(
                s.len() <= 1000,
                format!("custom_params.{key}: string values must be at most 1000 chars"),
            );
        }
        CustomValue::Array(items) => {
            if depth >= 1 {
                report.fail(format!(
                    "custom_params.{key}: nesting deeper than one level is not allowed"
                ));
                return;
            }
            report.check(
                items.len() <= 100,
                format!("custom_params.{key}: arrays allow at most 100 items"),
            );
            for item in items {
                validate_custom_value(key, item, depth + 1, report);
            }
        }
        CustomValue::Object(map) => {
            if depth >= 1 {
                report.fail(format!(
                    "custom_params.{key}: nesting deeper than one level is not allowed"
                ));
                return;
            }
            report.check(
                map.len() <= 50,
                format!("custom_params.{key}: nested objects allow at most 50 keys"),
            );
            for value in map.values() {
                validate_custom_value(key, value, depth + 1, report);
            }
        }
    }
}

/// Hit validator. `retention` is the tenant's horizon; hits older than it
/// are rejected outright rather than written and immediately swept.
pub fn validate_hit(
    hit: &TrackingHit,
    now: DateTime<Utc>,
    retention: Duration,
    max_custom_params: usize,
) -> Result<(), AppError> {
    let mut report = Report::default();

    report.check(!hit.app_id.is_empty(), "app_id is required");
    report.check(!hit.url.is_empty(), "url is required");
    report.check(!hit.user_agent.is_empty(), "user_agent is required");

    if !hit.url.is_empty() {
        report.check(hit.url.len() <= 2048, "url must be at most 2048 chars");
        report.check(Url::parse(&hit.url).is_ok(), "url must parse");
    }

    if !hit.user_agent.is_empty() {
        report.check(
            (10..=500).contains(&hit.user_agent.len()),
            "user_agent must be between 10 and 500 chars",
        );
        let ua = hit.user_agent.to_ascii_lowercase();
        report.check(
            UA_MARKERS.iter().any(|m| ua.contains(m)),
            "user_agent does not look like a browser or bot",
        );
    }

    report.check(hit.timestamp <= now, "timestamp must not be in the future");
    report.check(
        hit.timestamp >= now - retention,
        "timestamp is older than the retention horizon",
    );

    if let Some(res) = &hit.screen_resolution {
        report.check(
            is_screen_resolution(res),
            format!("screen_resolution '{res}' must match WxH"),
        );
    }
    if let Some(lang) = &hit.language {
        report.check(
            is_language_tag(lang),
            format!("language '{lang}' must match xx or xx-XX"),
        );
    }
    if let Some(tz) = &hit.timezone {
        report.check(
            is_known_timezone(tz),
            format!("timezone '{tz}' is not in the tz database"),
        );
    }
    if let Some(params) = &hit.custom_params {
        validate_custom_params(params, max_custom_params, &mut report);
    }

    report.into_result()
}

/// Session validator: timestamps consistent, duration bounded to a day.
pub fn validate_session(session: &Session, now: DateTime<Utc>) -> Result<(), AppError> {
    let mut report = Report::default();

    report.check(!session.session_id.is_empty(), "session_id is required");
    report.check(!session.app_id.is_empty(), "app_id is required");
    report.check(!session.entry_url.is_empty(), "entry_url is required");

    report.check(
        session.started_at <= session.last_activity,
        "started_at must not be after last_activity",
    );
    let end = session.ended_at.unwrap_or(now);
    report.check(
        session.last_activity <= end,
        "last_activity must not be after ended_at",
    );
    report.check(end <= now, "ended_at must not be in the future");
    report.check(
        (end - session.started_at).num_seconds() <= 86400,
        "session duration must be at most 86400 seconds",
    );
    report.check(session.page_views >= 1, "page_views must be at least 1");

    report.into_result()
}

/// Webhook subscription validator: http(s) URL, at least one event kind,
/// non-empty secret.
pub fn validate_webhook(webhook: &Webhook) -> Result<(), AppError> {
    let mut report = Report::default();

    report.check(!webhook.app_id.is_empty(), "app_id is required");
    report.check(
        is_http_url(&webhook.url),
        "url must be http(s) with a non-empty host",
    );
    report.check(!webhook.events.is_empty(), "at least one event kind is required");
    report.check(!webhook.secret.is_empty(), "secret is required");
    for (name, _) in &webhook.custom_headers {
        report.check(
            !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic()),
            format!("custom header name '{name}' is invalid"),
        );
    }

    report.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApplicationSettings, BrowserFamily, DeviceClass, OsFamily, WebhookEventKind};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn valid_app() -> Application {
        let now = Utc::now();
        Application {
            id: "my-app".into(),
            name: "My App".into(),
            description: None,
            domain: "example.com".into(),
            url: Some("https://example.com".into()),
            api_key: crate::ident::generate_api_key(),
            active: true,
            tags: vec!["prod".into()],
            metadata: BTreeMap::new(),
            settings: ApplicationSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn valid_hit() -> TrackingHit {
        TrackingHit {
            id: Uuid::new_v4(),
            app_id: "my-app".into(),
            session_id: "s-1".into(),
            url: "https://example.com/a".into(),
            referrer: None,
            user_agent: "Mozilla/5.0 (X11; Linux) Chrome/120".into(),
            ua_hash: crate::ident::user_agent_hash("Mozilla/5.0"),
            ip_address: None,
            device: DeviceClass::Desktop,
            browser: BrowserFamily::Chrome,
            os: OsFamily::Linux,
            is_bot: false,
            screen_resolution: None,
            language: None,
            timezone: None,
            country: None,
            custom_params: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn valid_application_passes() {
        assert!(validate_application(&valid_app(), false).is_ok());
    }

    #[test]
    fn all_violations_are_collected() {
        let mut app = valid_app();
        app.name = String::new();
        app.domain = "-bad-.com".into();
        app.settings.session_timeout_secs = 10;
        let err = validate_application(&app, false).unwrap_err();
        match err {
            AppError::Validation(details) => assert!(details.len() >= 3, "{details:?}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn webhook_url_required_when_enabled() {
        let mut app = valid_app();
        app.settings.webhook_enabled = true;
        assert!(validate_application(&app, false).is_err());
        app.settings.webhook_url = Some("https://hooks.example.com/x".into());
        assert!(validate_application(&app, false).is_ok());
    }

    #[test]
    fn domain_rules() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("a.b-c.example"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("-leading.example"));
        assert!(!is_valid_domain("trailing-.example"));
        assert!(!is_valid_domain(&format!("{}.com", "a".repeat(64))));
        assert!(!is_valid_domain(&"a.".repeat(130)));
    }

    #[test]
    fn valid_hit_passes() {
        let ok = validate_hit(&valid_hit(), Utc::now(), Duration::days(365), 10);
        assert!(ok.is_ok());
    }

    #[test]
    fn ua_length_boundaries() {
        let mut hit = valid_hit();
        hit.user_agent = "chrome/12".into(); // 9 chars
        assert!(validate_hit(&hit, Utc::now(), Duration::days(365), 10).is_err());
        hit.user_agent = "chrome/120".into(); // 10 chars
        assert!(validate_hit(&hit, Utc::now(), Duration::days(365), 10).is_ok());
        hit.user_agent = format!("mozilla {}", "x".repeat(500));
        assert!(validate_hit(&hit, Utc::now(), Duration::days(365), 10).is_err());
    }

    #[test]
    fn garbage_user_agent_rejected() {
        let mut hit = valid_hit();
        hit.user_agent = "definitely not a browser".into();
        assert!(validate_hit(&hit, Utc::now(), Duration::days(365), 10).is_err());
    }

    #[test]
    fn timestamp_boundaries() {
        let now = Utc::now();
        let mut hit = valid_hit();
        hit.timestamp = now;
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_ok());
        hit.timestamp = now + Duration::seconds(1);
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
        hit.timestamp = now - Duration::days(366);
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
    }

    #[test]
    fn optional_field_formats() {
        let mut hit = valid_hit();
        let now = Utc::now();
        hit.screen_resolution = Some("1920x1080".into());
        hit.language = Some("en-US".into());
        hit.timezone = Some("Europe/Berlin".into());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_ok());

        hit.screen_resolution = Some("1920*1080".into());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
        hit.screen_resolution = None;

        hit.language = Some("english".into());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
        hit.language = None;

        hit.timezone = Some("Mars/Olympus".into());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
    }

    #[test]
    fn custom_params_bounds() {
        let mut hit = valid_hit();
        let now = Utc::now();

        // 10 keys accepted, 11 rejected
        let params: CustomParams = (0..10)
            .map(|i| (format!("k{i}"), CustomValue::Number(i as f64)))
            .collect();
        hit.custom_params = Some(params.clone());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_ok());

        let mut params11 = params.clone();
        params11.insert("k10".into(), CustomValue::Null);
        hit.custom_params = Some(params11);
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());

        // string boundary: 1000 ok, 1001 rejected
        let mut p = CustomParams::new();
        p.insert("s".into(), CustomValue::String("x".repeat(1000)));
        hit.custom_params = Some(p.clone());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_ok());
        p.insert("s".into(), CustomValue::String("x".repeat(1001)));
        hit.custom_params = Some(p);
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());

        // one level of recursion allowed, two rejected
        let mut p = CustomParams::new();
        let inner = CustomValue::Object(BTreeMap::from([(
            "leaf".to_string(),
            CustomValue::Bool(true),
        )]));
        p.insert("o".into(), inner.clone());
        hit.custom_params = Some(p.clone());
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_ok());

        let nested_twice = CustomValue::Object(BTreeMap::from([("deep".to_string(), inner)]));
        p.insert("o".into(), nested_twice);
        hit.custom_params = Some(p);
        assert!(validate_hit(&hit, now, Duration::days(365), 10).is_err());
    }

    #[test]
    fn session_timestamp_ordering() {
        let now = Utc::now();
        let mut s = Session {
            session_id: "s".into(),
            app_id: "a".into(),
            started_at: now - Duration::seconds(300),
            last_activity: now - Duration::seconds(10),
            ended_at: None,
            entry_url: "/".into(),
            exit_url: "/x".into(),
            page_views: 2,
            device: None,
            browser: None,
            os: None,
            country: None,
        };
        assert!(validate_session(&s, now).is_ok());

        s.last_activity = s.started_at - Duration::seconds(5);
        assert!(validate_session(&s, now).is_err());

        s.last_activity = now - Duration::seconds(10);
        s.started_at = now - Duration::days(2);
        assert!(validate_session(&s, now).is_err()); // duration > 86400
    }

    #[test]
    fn webhook_scheme_policy() {
        let now = Utc::now();
        let mut w = Webhook {
            id: Uuid::new_v4(),
            app_id: "a".into(),
            url: "https://hooks.example.com/in".into(),
            events: vec![WebhookEventKind::PageView],
            secret: "shh".into(),
            active: true,
            custom_headers: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(validate_webhook(&w).is_ok());

        w.url = "ftp://hooks.example.com/in".into();
        assert!(validate_webhook(&w).is_err());

        w.url = "https://hooks.example.com/in".into();
        w.events.clear();
        assert!(validate_webhook(&w).is_err());
    }
}
