//! The four-stage security pipeline

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, SET_COOKIE, VARY};
use http::{HeaderMap, HeaderValue, Response, StatusCode, request};
use serde_json::json;
use tracing::{debug, warn};

use super::cors::{CorsOutcome, CorsPolicy};
use super::csrf::CsrfGuard;
use super::headers::{SecurityHeaders, strip_identifying};
use super::rate_limit::{RateLimiter, client_ip};
use super::SecurityConfig;
use crate::{GatewayError, Site};

/// Request passed every stage
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    /// Headers to attach to the response
    pub headers: HeaderMap,
    /// The request was a CORS preflight and should be answered directly
    pub preflight: bool,
    /// Token minted for a safe request, also present in `headers`
    pub csrf_token: Option<String>,
}

impl Verdict {
    /// Merge the gate's headers into an outgoing response.
    ///
    /// Gate headers replace existing ones except `Set-Cookie` and `Vary`,
    /// which are appended. `Server` and `X-Powered-By` are removed.
    pub fn apply_to(&self, target: &mut HeaderMap) {
        strip_identifying(target);
        for name in self.headers.keys() {
            if name != SET_COOKIE && name != VARY {
                target.remove(name);
            }
            for value in self.headers.get_all(name) {
                target.append(name.clone(), value.clone());
            }
        }
    }

    /// `204 No Content` answer for a preflight.
    pub fn preflight_response(&self) -> Response<String> {
        let mut response = Response::new(String::new());
        *response.status_mut() = StatusCode::NO_CONTENT;
        self.apply_to(response.headers_mut());
        response
    }
}

/// Request refused by one of the stages
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}: {message}")]
pub struct Rejection {
    pub status: StatusCode,
    /// Machine-readable reason (`cors_origin_denied`, ...)
    pub error: &'static str,
    pub message: String,
    pub headers: HeaderMap,
    pub timestamp: DateTime<Utc>,
}

impl Rejection {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            headers,
            timestamp: Utc::now(),
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": self.error,
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body().to_string());
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.extend(self.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// CORS, then rate limiting, then CSRF, then hardening headers
pub struct SecurityGate {
    cors: CorsPolicy,
    limiter: Arc<RateLimiter>,
    rate_limit_enabled: bool,
    csrf: CsrfGuard,
    headers: SecurityHeaders,
}

impl SecurityGate {
    pub fn new(config: &SecurityConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            cors: CorsPolicy::new(
                config.cors.clone(),
                &config.platform_domain,
                config.environment,
            ),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            rate_limit_enabled: config.rate_limit.enabled,
            csrf: CsrfGuard::new(config.csrf.clone(), config.environment)?,
            headers: SecurityHeaders::new(config),
        })
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    pub fn evaluate(&self, site: &Site, parts: &request::Parts) -> Result<Verdict, Rejection> {
        let mut headers = HeaderMap::new();

        match self.cors.evaluate(site, parts) {
            CorsOutcome::NotApplicable => {}
            CorsOutcome::Allowed(cors) => headers.extend(cors),
            CorsOutcome::Preflight { headers: cors, allowed } => {
                if !allowed {
                    warn!(
                        site_id = %site.id,
                        origin = ?parts.headers.get(http::header::ORIGIN),
                        reason = "cors_origin_denied",
                        "Preflight from disallowed origin"
                    );
                }
                headers.extend(cors);
                headers.extend(self.headers.compose(site));
                return Ok(Verdict {
                    headers,
                    preflight: true,
                    csrf_token: None,
                });
            }
            CorsOutcome::Denied { origin } => {
                warn!(
                    site_id = %site.id,
                    origin = %origin,
                    reason = "cors_origin_denied",
                    "Rejected cross-origin request"
                );
                return Err(self.reject(
                    site,
                    StatusCode::FORBIDDEN,
                    "cors_origin_denied",
                    format!("Origin {} is not allowed", origin),
                    headers,
                ));
            }
        }

        if self.rate_limit_enabled {
            let ip = client_ip(&parts.headers);
            let decision = self.limiter.check(&self.limiter.key_for(site, &ip));
            headers.extend(decision.headers());
            if decision.limited {
                warn!(
                    site_id = %site.id,
                    client_ip = %ip,
                    reason = "rate_limit_exceeded",
                    "Rate limit exceeded"
                );
                return Err(self.reject(
                    site,
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limit_exceeded",
                    format!(
                        "Too many requests. Retry in {} seconds.",
                        decision.retry_after_secs()
                    ),
                    headers,
                ));
            }
        }

        let mut csrf_token = None;
        if self.csrf.enabled() {
            if CsrfGuard::is_safe_method(&parts.method) {
                let token = self.csrf.issue();
                let cookie = self.csrf.cookie(token.clone(), parts);
                if let Ok(value) = HeaderValue::try_from(cookie.to_string()) {
                    headers.append(SET_COOKIE, value);
                }
                if let Ok(value) = HeaderValue::try_from(token.as_str()) {
                    headers.insert(self.csrf.header_name().clone(), value);
                }
                csrf_token = Some(token);
            } else if self.csrf.is_exempt(parts.uri.path()) {
                debug!("CSRF check skipped for exempt path {}", parts.uri.path());
            } else if let Err(failure) = self.csrf.validate_request(parts) {
                warn!(
                    site_id = %site.id,
                    client_ip = %client_ip(&parts.headers),
                    reason = "csrf_validation_failed",
                    failure = %failure,
                    "CSRF validation failed"
                );
                return Err(self.reject(
                    site,
                    StatusCode::FORBIDDEN,
                    "csrf_validation_failed",
                    "CSRF token validation failed",
                    headers,
                ));
            }
        }

        headers.extend(self.headers.compose(site));
        Ok(Verdict {
            headers,
            preflight: false,
            csrf_token,
        })
    }

    /// Rejections carry the stage headers gathered so far plus hardening headers.
    fn reject(
        &self,
        site: &Site,
        status: StatusCode,
        error: &'static str,
        message: impl Into<String>,
        mut headers: HeaderMap,
    ) -> Rejection {
        headers.extend(self.headers.compose(site));
        Rejection::new(status, error, message, headers)
    }
}
