//! Signed delivery URLs.
//!
//! A signed URL carries `expires` (unix seconds) and `sig` query parameters.
//! `sig` is `base64url(HMAC-SHA256(secret, "{path}:{expires}"))` over the
//! path bytes exactly as given, so any change to the path (including its
//! slashes) or the expiry invalidates it.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};

type HmacSha256 = Hmac<Sha256>;

pub const EXPIRES_PARAM: &str = "expires";
pub const SIGNATURE_PARAM: &str = "sig";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("signed path must not be empty")]
    EmptyPath,
    #[error("invalid or expired")]
    Rejected,
    #[error("expiry overflows a unix timestamp")]
    ExpiryOverflow,
}

/// Appends `expires` and `sig` to `base` + `path`.
pub fn sign_url(
    base: &str,
    secret: &[u8],
    path: &str,
    expires_at: i64,
) -> Result<String, SigningError> {
    if secret.is_empty() {
        return Err(SigningError::EmptySecret);
    }
    if path.is_empty() {
        return Err(SigningError::EmptyPath);
    }
    let signature = compute_signature(secret, path, expires_at)?;
    let base = base.trim_end_matches('/');
    let slash = if path.starts_with('/') { "" } else { "/" };
    let separator = if path.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{base}{slash}{path}{separator}{EXPIRES_PARAM}={expires_at}&{SIGNATURE_PARAM}={signature}"
    ))
}

/// Validates a signature against the current wall clock.
pub fn validate_signature(secret: &[u8], path: &str, expires_at: i64, sig: &str) -> bool {
    validate_signature_at(secret, path, expires_at, sig, Utc::now())
}

pub fn validate_signature_at(
    secret: &[u8],
    path: &str,
    expires_at: i64,
    sig: &str,
    now: DateTime<Utc>,
) -> bool {
    if secret.is_empty() || path.is_empty() || sig.is_empty() {
        return false;
    }
    if expires_at <= now.timestamp() {
        return false;
    }
    let Ok(provided) = URL_SAFE_NO_PAD.decode(sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    feed(&mut mac, path, expires_at);
    mac.verify_slice(&provided).is_ok()
}

fn compute_signature(secret: &[u8], path: &str, expires_at: i64) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::EmptySecret)?;
    feed(&mut mac, path, expires_at);
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn feed(mac: &mut HmacSha256, path: &str, expires_at: i64) {
    mac.update(path.as_bytes());
    mac.update(b":");
    mac.update(expires_at.to_string().as_bytes());
}

pub fn stream_path(channel: &str, segment: &str) -> String {
    format!("/stream/{channel}/{segment}")
}

pub fn key_path(channel: &str, day: NaiveDate) -> String {
    format!("/keys/{channel}/{}.key", day.format("%Y-%m-%d"))
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub path: String,
    pub expires_at: i64,
}

/// Binds the delivery base URL, secret and default lifetime together.
#[derive(Clone)]
pub struct DeliverySigner {
    base_url: String,
    secret: Vec<u8>,
    default_ttl: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for DeliverySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySigner")
            .field("base_url", &self.base_url)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl DeliverySigner {
    pub fn new(
        base_url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        default_ttl: Duration,
    ) -> Result<Self, SigningError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SigningError::EmptySecret);
        }
        Ok(Self {
            base_url: base_url.into(),
            secret,
            default_ttl,
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn sign_path(&self, path: &str, ttl: Option<Duration>) -> Result<SignedUrl, SigningError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| self.clock.now().timestamp().checked_add(secs))
            .ok_or(SigningError::ExpiryOverflow)?;
        self.sign_path_until(path, expires_at)
    }

    pub fn sign_path_until(&self, path: &str, expires_at: i64) -> Result<SignedUrl, SigningError> {
        let url = sign_url(&self.base_url, &self.secret, path, expires_at)?;
        Ok(SignedUrl {
            url,
            path: path.to_string(),
            expires_at,
        })
    }

    pub fn sign_segment(&self, channel: &str, segment: &str) -> Result<SignedUrl, SigningError> {
        self.sign_path(&stream_path(channel, segment), None)
    }

    pub fn sign_key(
        &self,
        channel: &str,
        day: NaiveDate,
        expires_at: i64,
    ) -> Result<SignedUrl, SigningError> {
        self.sign_path_until(&key_path(channel, day), expires_at)
    }

    pub fn validate(&self, path: &str, expires_at: i64, sig: &str) -> bool {
        let valid = validate_signature_at(&self.secret, path, expires_at, sig, self.clock.now());
        if !valid {
            debug!("rejected signed delivery request");
        }
        valid
    }

    /// Validates the `expires`/`sig` pair carried in a raw query string.
    pub fn verify_request(&self, path: &str, query: &str) -> Result<(), SigningError> {
        let mut expires = None;
        let mut sig = None;
        for (name, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        {
            match name.as_ref() {
                EXPIRES_PARAM => expires = value.parse::<i64>().ok(),
                SIGNATURE_PARAM => sig = Some(value.into_owned()),
                _ => {}
            }
        }
        match (expires, sig) {
            (Some(expires), Some(sig)) if self.validate(path, expires, &sig) => Ok(()),
            _ => Err(SigningError::Rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"super-secret-key";

    fn query_value(url: &str, name: &str) -> String {
        let query = url.split_once('?').unwrap().1;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    #[test]
    fn rejects_empty_inputs_when_signing() {
        assert!(matches!(
            sign_url("https://cdn", b"", "/a.ts", 10),
            Err(SigningError::EmptySecret)
        ));
        assert!(matches!(
            sign_url("https://cdn", SECRET, "", 10),
            Err(SigningError::EmptyPath)
        ));
    }

    #[test]
    fn never_doubles_separator() {
        let expires = Utc::now().timestamp() + 60;
        let a = sign_url("https://cdn.example/", SECRET, "/stream/ch1/seg.ts", expires).unwrap();
        let b = sign_url("https://cdn.example", SECRET, "/stream/ch1/seg.ts", expires).unwrap();
        let c = sign_url("https://cdn.example//", SECRET, "/stream/ch1/seg.ts", expires).unwrap();
        assert!(a.starts_with("https://cdn.example/stream/ch1/seg.ts?expires="));
        assert_eq!(a, b);
        assert_eq!(a, c);

        let relative = sign_url("https://cdn.example/", SECRET, "stream/ch1/seg.ts", expires).unwrap();
        assert!(relative.starts_with("https://cdn.example/stream/ch1/seg.ts?expires="));
        assert_ne!(
            query_value(&a, SIGNATURE_PARAM),
            query_value(&relative, SIGNATURE_PARAM)
        );
    }

    #[test]
    fn path_must_match_byte_for_byte() {
        let expires = Utc::now().timestamp() + 60;
        let url = sign_url("https://cdn", SECRET, "/stream/ch1/seg.ts", expires).unwrap();
        let sig = query_value(&url, SIGNATURE_PARAM);
        assert!(validate_signature(SECRET, "/stream/ch1/seg.ts", expires, &sig));
        assert!(!validate_signature(SECRET, "stream/ch1/seg.ts", expires, &sig));
        assert!(!validate_signature(SECRET, "//stream/ch1/seg.ts", expires, &sig));
        assert!(!validate_signature(SECRET, "/stream//ch1/seg.ts", expires, &sig));
        assert!(!validate_signature(SECRET, "/stream/ch1/seg.ts/", expires, &sig));
    }

    #[test]
    fn oversized_ttl_is_an_error() {
        let signer = DeliverySigner::new("https://cdn", SECRET.to_vec(), Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            signer.sign_path("/a.ts", Some(Duration::from_secs(u64::MAX))),
            Err(SigningError::ExpiryOverflow)
        ));
        assert!(matches!(
            signer.sign_path("/a.ts", Some(Duration::from_secs(i64::MAX as u64))),
            Err(SigningError::ExpiryOverflow)
        ));
    }

    #[test]
    fn rejects_empty_inputs_when_validating() {
        let expires = Utc::now().timestamp() + 60;
        let url = sign_url("https://cdn", SECRET, "/a.ts", expires).unwrap();
        let sig = query_value(&url, SIGNATURE_PARAM);
        assert!(validate_signature(SECRET, "/a.ts", expires, &sig));
        assert!(!validate_signature(b"", "/a.ts", expires, &sig));
        assert!(!validate_signature(SECRET, "", expires, &sig));
        assert!(!validate_signature(SECRET, "/a.ts", expires, ""));
    }

    #[test]
    fn rejects_garbage_signature() {
        let expires = Utc::now().timestamp() + 60;
        assert!(!validate_signature(SECRET, "/a.ts", expires, "%%%not-base64"));
        assert!(!validate_signature(SECRET, "/a.ts", expires, "AAAA"));
    }

    #[test]
    fn expiry_equal_to_now_is_rejected() {
        let now = Utc::now();
        let expires = now.timestamp();
        let url = sign_url("https://cdn", SECRET, "/a.ts", expires).unwrap();
        let sig = query_value(&url, SIGNATURE_PARAM);
        assert!(!validate_signature_at(SECRET, "/a.ts", expires, &sig, now));
    }

    #[test]
    fn appends_to_existing_query() {
        let url = sign_url("https://cdn", SECRET, "/a.m3u8?variant=720p", 99).unwrap();
        assert!(url.contains("/a.m3u8?variant=720p&expires=99&sig="));
    }

    #[test]
    fn verify_request_parses_query() {
        let signer = DeliverySigner::new("https://cdn", SECRET.to_vec(), Duration::from_secs(900))
            .unwrap();
        let signed = signer.sign_segment("ch1", "seg_00001.ts").unwrap();
        let query = signed.url.split_once('?').unwrap().1;
        signer
            .verify_request("/stream/ch1/seg_00001.ts", query)
            .unwrap();
        assert!(signer
            .verify_request("/stream/ch1/seg_00002.ts", query)
            .is_err());
        assert!(signer
            .verify_request("/stream/ch1/seg_00001.ts", "expires=abc&sig=x")
            .is_err());
        assert!(signer.verify_request("/stream/ch1/seg_00001.ts", "").is_err());
    }
}
