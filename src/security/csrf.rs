//! Double-submit CSRF tokens
//!
//! Token format: `<timestamp_ms>.<nonce_hex>.<signature_hex>`, where the
//! signature is HMAC-SHA256 over `<timestamp_ms>.<nonce_hex>`. Safe requests
//! receive a fresh token as an `HttpOnly` cookie and in a response header;
//! unsafe requests must send the same token back in the header and in the
//! cookie.

use std::fmt;

use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use http::header::{COOKIE, HOST};
use http::{HeaderName, Method, request};
use sha2::Sha256;
use tracing::warn;

use super::{CsrfConfig, Environment};
use crate::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Tokens dated this far in the future are rejected.
const MAX_FUTURE_SKEW_MS: i64 = 60_000;

const NONCE_LEN: usize = 16;

/// Why a request failed CSRF verification; callers only ever see a 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    /// Header or cookie token absent
    Missing,
    /// Header and cookie tokens differ
    Mismatch,
    /// Malformed, forged, or dated in the future
    Invalid,
    /// Older than the validity window
    Expired,
}

impl CsrfFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            CsrfFailure::Missing => "missing",
            CsrfFailure::Mismatch => "mismatch",
            CsrfFailure::Invalid => "invalid",
            CsrfFailure::Expired => "expired",
        }
    }
}

impl fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issues and verifies signed CSRF tokens
#[derive(Clone)]
pub struct CsrfGuard {
    config: CsrfConfig,
    mac: HmacSha256,
    header_name: HeaderName,
    secure_cookie: bool,
}

impl fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfGuard")
            .field("enabled", &self.config.enabled)
            .field("cookie_name", &self.config.cookie_name)
            .field("header_name", &self.header_name)
            .finish_non_exhaustive()
    }
}

impl CsrfGuard {
    pub fn new(config: CsrfConfig, environment: Environment) -> Result<Self, GatewayError> {
        let secret = match &config.secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                if config.enabled {
                    warn!(
                        "No CSRF secret configured; using a random per-process secret. \
                         Tokens will not survive restarts or validate across instances."
                    );
                }
                rand::random::<[u8; 32]>().to_vec()
            }
        };
        let mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| GatewayError::Security(format!("CSRF secret: {}", e)))?;
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes())
            .map_err(|e| GatewayError::Security(format!("CSRF header name: {}", e)))?;

        Ok(Self {
            mac,
            header_name,
            secure_cookie: environment == Environment::Production,
            config,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn issue(&self) -> String {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> String {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let payload = format!("{}.{}", now.timestamp_millis(), hex::encode(nonce));
        let signature = self.sign(&payload);
        format!("{}.{}", payload, signature)
    }

    pub fn verify(&self, token: &str) -> Result<(), CsrfFailure> {
        self.verify_at(token, Utc::now())
    }

    /// Check the signature, then the token's age.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<(), CsrfFailure> {
        let mut parts = token.split('.');
        let (Some(timestamp), Some(nonce), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CsrfFailure::Invalid);
        };
        let issued_ms: i64 = timestamp.parse().map_err(|_| CsrfFailure::Invalid)?;
        if nonce.len() != NONCE_LEN * 2 || hex::decode(nonce).is_err() {
            return Err(CsrfFailure::Invalid);
        }
        let signature = hex::decode(signature).map_err(|_| CsrfFailure::Invalid)?;

        let mut mac = self.mac.clone();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(nonce.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CsrfFailure::Invalid)?;

        let age_ms = now.timestamp_millis() - issued_ms;
        if age_ms < -MAX_FUTURE_SKEW_MS {
            return Err(CsrfFailure::Invalid);
        }
        if age_ms > self.config.token_validity.as_millis() as i64 {
            return Err(CsrfFailure::Expired);
        }
        Ok(())
    }

    pub fn is_safe_method(method: &Method) -> bool {
        matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The token from the request's CSRF cookie, if any
    pub fn cookie_token(&self, parts: &request::Parts) -> Option<String> {
        parts
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| Cookie::split_parse(value))
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == self.config.cookie_name)
            .map(|cookie| cookie.value().to_owned())
            .filter(|token| !token.is_empty())
    }

    /// Double-submit check for an unsafe request.
    pub fn validate_request(&self, parts: &request::Parts) -> Result<(), CsrfFailure> {
        self.validate_request_at(parts, Utc::now())
    }

    pub fn validate_request_at(
        &self,
        parts: &request::Parts,
        now: DateTime<Utc>,
    ) -> Result<(), CsrfFailure> {
        let header_token = parts
            .headers
            .get(&self.header_name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty());
        let cookie_token = self.cookie_token(parts);

        let (Some(header_token), Some(cookie_token)) = (header_token, cookie_token) else {
            return Err(CsrfFailure::Missing);
        };
        if header_token.as_bytes() != cookie_token.as_bytes() {
            return Err(CsrfFailure::Mismatch);
        }
        self.verify_at(header_token, now)
    }

    /// `Set-Cookie` for a freshly issued token, scoped to the request host.
    pub fn cookie(&self, token: String, parts: &request::Parts) -> Cookie<'static> {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| parts.uri.host())
            .map(|host| host.split(':').next().unwrap_or(host).to_ascii_lowercase())
            .filter(|host| !host.is_empty());

        let max_age = time::Duration::seconds(self.config.token_validity.as_secs() as i64);
        let mut builder = Cookie::build((self.config.cookie_name.clone(), token))
            .http_only(true)
            .secure(self.secure_cookie)
            .same_site(SameSite::Strict)
            .path("/")
            .max_age(max_age);
        if let Some(host) = host {
            builder = builder.domain(host);
        }
        builder.build()
    }
}
