// Identifiers and Crypto Helpers
//
// API-key generation/validation, deterministic session-id derivation,
// user-agent hashing for unique-visitor counting, and webhook payload
// signatures.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Length of the opaque tenant API key. 32 alphanumeric chars carry
/// log2(62^32) ≈ 190 bits of entropy.
pub const API_KEY_LEN: usize = 32;

/// Generate a fresh opaque API key.
pub fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Syntactic API-key check: exact length, alphanumeric charset.
pub fn api_key_is_well_formed(key: &str) -> bool {
    key.len() == API_KEY_LEN && key.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Tenant ids are either UUIDs or up to 50 chars of `[A-Za-z0-9_-]`.
pub fn app_id_is_well_formed(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    if Uuid::parse_str(id).is_ok() {
        return true;
    }
    id.len() <= 50
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Derive a stable session id for a visitor that did not supply one:
/// UUIDv5 over user_agent ∥ ip ∥ tenant_id in the nil namespace. The
/// same visitor hashing to the same id across bursts stitches sessions
/// without storing PII.
pub fn derive_session_id(user_agent: &str, ip: &str, app_id: &str) -> String {
    let name = format!("{user_agent}{ip}{app_id}");
    Uuid::new_v5(&Uuid::nil(), name.as_bytes()).to_string()
}

/// Short user-agent fingerprint stored per hit: first 16 hex chars of
/// SHA-256. Combined with the anonymized IP and session id it forms the
/// unique-visitor triple.
pub fn user_agent_hash(user_agent: &str) -> String {
    let digest = Sha256::digest(user_agent.as_bytes());
    hex::encode(&digest[..8])
}

/// HMAC-SHA-256 of the serialized webhook payload, keyed by the
/// subscription secret. Returned with the `sha256=` prefix expected in
/// the `X-Webhook-Signature` header.
pub fn webhook_signature(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Strong ETag for an embedded static asset.
pub fn asset_etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_well_formed_and_distinct() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(api_key_is_well_formed(&a));
        assert!(api_key_is_well_formed(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn api_key_syntax_rejects_bad_shapes() {
        assert!(!api_key_is_well_formed(""));
        assert!(!api_key_is_well_formed("short"));
        assert!(!api_key_is_well_formed(&"x".repeat(33)));
        assert!(!api_key_is_well_formed(&format!("{}!", "x".repeat(31))));
    }

    #[test]
    fn app_id_accepts_uuid_and_slug() {
        assert!(app_id_is_well_formed(&Uuid::new_v4().to_string()));
        assert!(app_id_is_well_formed("my-app_01"));
        assert!(!app_id_is_well_formed(""));
        assert!(!app_id_is_well_formed(&"a".repeat(51)));
        assert!(!app_id_is_well_formed("has space"));
    }

    #[test]
    fn session_derivation_is_deterministic() {
        let a = derive_session_id("Mozilla/5.0 Chrome", "203.0.113.0", "T");
        let b = derive_session_id("Mozilla/5.0 Chrome", "203.0.113.0", "T");
        assert_eq!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());

        let c = derive_session_id("Mozilla/5.0 Chrome", "203.0.113.0", "T2");
        assert_ne!(a, c);
    }

    #[test]
    fn ua_hash_is_16_hex_chars() {
        let h = user_agent_hash("Mozilla/5.0");
        assert_eq!(h.len(), 16);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(h, user_agent_hash("Mozilla/5.0"));
    }

    #[test]
    fn signature_is_prefixed_hex_and_keyed() {
        let sig = webhook_signature("secret", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_ne!(sig, webhook_signature("other", b"{\"a\":1}"));
        assert_ne!(sig, webhook_signature("secret", b"{\"a\":2}"));
    }
}
