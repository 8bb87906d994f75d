// Classification Utilities
//
// IP validity/anonymization and user-agent inference. Everything here is
// a pure function over the request data so the ingest pipeline can be
// exercised without any I/O.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::models::{BrowserFamily, DeviceClass, OsFamily};

/// Parse a canonical IPv4 dotted-quad or canonical IPv6 address. The std
/// parser already rejects IPv4 octets with leading zeros ("192.168.1.01"),
/// which is the security-hygiene behavior we want.
pub fn parse_ip(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>().ok()
}

pub fn is_valid_ip(s: &str) -> bool {
    parse_ip(s).is_some()
}

/// Private / non-routable classification: 10/8, 172.16/12, 192.168/16,
/// 127/8, 169.254/16, ::1, fe80::/10, fc00::/7.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7
        }
    }
}

/// Lossy, deterministic anonymization: IPv4 drops the last octet, IPv6
/// drops the low 64 bits. Idempotent by construction.
pub fn anonymize_ip(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], 0))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            IpAddr::V6(Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0))
        }
    }
}

/// Anonymize an IP given as a string; None if it does not parse.
pub fn anonymize_ip_str(s: &str) -> Option<String> {
    parse_ip(s).map(|ip| anonymize_ip(&ip).to_string())
}

/// Client-IP extraction: X-Forwarded-For (first element), X-Real-IP,
/// X-Client-IP, then the socket peer. First syntactically valid address
/// wins.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            if let Some(ip) = parse_ip(first.trim()) {
                return Some(ip);
            }
        }
    }
    for name in ["x-real-ip", "x-client-ip"] {
        if let Some(ip) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_ip(v.trim()))
        {
            return Some(ip);
        }
    }
    peer
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "robot",
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
];

const MOBILE_MARKERS: &[&str] = &[
    "mobile",
    "android",
    "iphone",
    "ipod",
    "blackberry",
    "windows phone",
    "opera mini",
];

/// Inferred client profile for one user-agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UaProfile {
    pub is_bot: bool,
    pub device: DeviceClass,
    pub browser: BrowserFamily,
    pub os: OsFamily,
}

pub fn is_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    BOT_MARKERS.iter().any(|m| ua.contains(m))
}

/// Substring-based, case-insensitive user-agent classification. Ordered
/// tests, first match wins per category.
pub fn classify_user_agent(user_agent: &str) -> UaProfile {
    let ua = user_agent.to_ascii_lowercase();

    let is_bot = BOT_MARKERS.iter().any(|m| ua.contains(m));

    // iPad UAs also carry "mobile"; the tablet check wins only for ipad
    let device = if ua.contains("ipad") {
        DeviceClass::Tablet
    } else if MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
        DeviceClass::Mobile
    } else if ua.contains("tablet") {
        DeviceClass::Tablet
    } else {
        DeviceClass::Desktop
    };

    // Edge and Opera precede Chrome because their UAs also contain
    // "chrome"; Safari is last because it appears in Chrome UAs.
    let browser = if ua.contains("edge") {
        BrowserFamily::Edge
    } else if ua.contains("opera") {
        BrowserFamily::Opera
    } else if ua.contains("chrome") {
        BrowserFamily::Chrome
    } else if ua.contains("firefox") {
        BrowserFamily::Firefox
    } else if ua.contains("safari") {
        BrowserFamily::Safari
    } else {
        BrowserFamily::Other
    };

    let os = if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod") {
        OsFamily::Ios
    } else if ua.contains("android") {
        OsFamily::Android
    } else if ua.contains("windows") {
        OsFamily::Windows
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        OsFamily::Macos
    } else if ua.contains("linux") {
        OsFamily::Linux
    } else {
        OsFamily::Other
    };

    UaProfile {
        is_bot,
        device,
        browser,
        os,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const CHROME_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
    const IPHONE_SAFARI: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD_SAFARI: &str =
        "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) Version/17.0 Mobile/15E148 Safari/604.1";

    #[test]
    fn ipv4_leading_zero_rejected() {
        assert!(is_valid_ip("192.168.1.1"));
        assert!(!is_valid_ip("192.168.1.01"));
        assert!(!is_valid_ip("256.1.1.1"));
        assert!(is_valid_ip("::1"));
        assert!(is_valid_ip("2001:db8::42"));
        assert!(!is_valid_ip("not-an-ip"));
    }

    #[test]
    fn private_ranges_classified() {
        for s in ["10.0.0.1", "172.16.5.4", "192.168.0.1", "127.0.0.1", "169.254.1.1", "::1", "fe80::1", "fc00::1", "fd12::1"] {
            assert!(is_private_ip(&s.parse().unwrap()), "{s} should be private");
        }
        for s in ["8.8.8.8", "203.0.113.9", "2001:db8::1", "172.32.0.1"] {
            assert!(!is_private_ip(&s.parse().unwrap()), "{s} should be public");
        }
    }

    #[test]
    fn anonymize_zeroes_host_bits() {
        assert_eq!(anonymize_ip_str("203.0.113.42").unwrap(), "203.0.113.0");
        assert_eq!(
            anonymize_ip_str("2001:db8:1:2:3:4:5:6").unwrap(),
            "2001:db8:1:2::"
        );
    }

    #[test]
    fn anonymize_is_idempotent() {
        for s in ["203.0.113.42", "10.1.2.3", "2001:db8:1:2:3:4:5:6", "::1"] {
            let once = anonymize_ip_str(s).unwrap();
            assert_eq!(anonymize_ip_str(&once).unwrap(), once);
        }
    }

    #[test]
    fn client_ip_header_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let ip = extract_client_ip(&headers, None).unwrap();
        assert_eq!(ip.to_string(), "203.0.113.7");

        // Invalid XFF falls through to X-Real-IP
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let ip = extract_client_ip(&headers, None).unwrap();
        assert_eq!(ip.to_string(), "198.51.100.2");

        // Nothing usable: socket peer wins
        let headers = HeaderMap::new();
        let peer: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(extract_client_ip(&headers, Some(peer)), Some(peer));
    }

    #[test]
    fn bot_markers_case_insensitive() {
        assert!(is_bot("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        assert!(is_bot("my-CRAWLER/1.0"));
        assert!(is_bot("facebookexternalhit/1.1"));
        assert!(!is_bot(CHROME_LINUX));
    }

    #[test]
    fn device_tiebreak_ipad_is_tablet_iphone_is_mobile() {
        assert_eq!(classify_user_agent(IPAD_SAFARI).device, DeviceClass::Tablet);
        assert_eq!(
            classify_user_agent(IPHONE_SAFARI).device,
            DeviceClass::Mobile
        );
        assert_eq!(classify_user_agent(CHROME_LINUX).device, DeviceClass::Desktop);
        assert_eq!(
            classify_user_agent("SomeBrowser Tablet Build").device,
            DeviceClass::Tablet
        );
    }

    #[test]
    fn browser_priority_order() {
        assert_eq!(
            classify_user_agent("Mozilla/5.0 Chrome/120 Safari/537 Edge/120").browser,
            BrowserFamily::Edge
        );
        assert_eq!(
            classify_user_agent("Mozilla/5.0 Chrome/120 Safari/537 Opera/95").browser,
            BrowserFamily::Opera
        );
        assert_eq!(classify_user_agent(CHROME_LINUX).browser, BrowserFamily::Chrome);
        assert_eq!(
            classify_user_agent("Mozilla/5.0 Gecko/20100101 Firefox/121.0").browser,
            BrowserFamily::Firefox
        );
        assert_eq!(classify_user_agent(IPHONE_SAFARI).browser, BrowserFamily::Safari);
    }

    #[test]
    fn os_priority_order() {
        assert_eq!(classify_user_agent(IPHONE_SAFARI).os, OsFamily::Ios);
        assert_eq!(
            classify_user_agent("Mozilla/5.0 (Linux; Android 14) Chrome/120").os,
            OsFamily::Android
        );
        assert_eq!(
            classify_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64) Chrome/120").os,
            OsFamily::Windows
        );
        assert_eq!(
            classify_user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) Safari/605").os,
            OsFamily::Macos
        );
        assert_eq!(classify_user_agent(CHROME_LINUX).os, OsFamily::Linux);
    }
}
