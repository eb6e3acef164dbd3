//! Origin checks and CORS response headers

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
    VARY,
};
use http::{HeaderMap, HeaderValue, Method, request};

use super::{CorsConfig, Environment};
use crate::Site;

/// Result of the CORS stage
#[derive(Debug, Clone)]
pub enum CorsOutcome {
    /// CORS disabled or no `Origin` header
    NotApplicable,
    /// Cross-origin request from an allowed origin
    Allowed(HeaderMap),
    /// `OPTIONS` preflight; answered directly with these headers
    Preflight { headers: HeaderMap, allowed: bool },
    /// Cross-origin request from an origin that is not allowed
    Denied { origin: String },
}

/// Compiled CORS settings
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    config: CorsConfig,
    platform_domain: String,
    /// Accept `http://` for a Site's own hosts (development only)
    insecure_site_origins: bool,
    allow_methods: Option<HeaderValue>,
    allow_headers: Option<HeaderValue>,
}

fn join_header(items: &[String]) -> Option<HeaderValue> {
    if items.is_empty() {
        return None;
    }
    HeaderValue::from_str(&items.join(", ")).ok()
}

/// Host part of an origin (`https://Shop.Example.com:8443` -> `shop.example.com`)
fn origin_host(origin: &str) -> Option<String> {
    let (_, rest) = origin.split_once("://")?;
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Match one configured pattern against a request origin.
///
/// `*` matches anything. `*.example.com` matches `example.com` and any
/// subdomain of it, on any scheme and port. Anything else must equal the
/// origin exactly (case-insensitive, trailing slash ignored).
pub(crate) fn matches_pattern(pattern: &str, origin: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('/');
    if pattern == "*" {
        return true;
    }
    if let Some(domain) = pattern.strip_prefix("*.") {
        let domain = domain.to_ascii_lowercase();
        return origin_host(origin).is_some_and(|host| {
            host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        });
    }
    pattern.eq_ignore_ascii_case(origin.trim_end_matches('/'))
}

impl CorsPolicy {
    pub fn new(config: CorsConfig, platform_domain: &str, environment: Environment) -> Self {
        Self {
            allow_methods: join_header(&config.allowed_methods),
            allow_headers: join_header(&config.allowed_headers),
            platform_domain: platform_domain.to_owned(),
            insecure_site_origins: environment == Environment::Development,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether `origin` may make credentialed cross-origin calls to `site`.
    pub fn is_origin_allowed(&self, origin: &str, site: &Site) -> bool {
        if self
            .config
            .allowed_origins
            .iter()
            .any(|pattern| matches_pattern(pattern, origin))
        {
            return true;
        }

        let origin = origin.trim_end_matches('/').to_ascii_lowercase();
        site.hosts(&self.platform_domain).iter().any(|host| {
            origin == format!("https://{}", host)
                || (self.insecure_site_origins && origin == format!("http://{}", host))
        })
    }

    fn is_preflight(parts: &request::Parts) -> bool {
        parts.method == Method::OPTIONS && parts.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn allow_origin(&self, headers: &mut HeaderMap, origin: &HeaderValue) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.append(VARY, HeaderValue::from_static("Origin"));
        if self.config.allow_credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
    }

    pub fn evaluate(&self, site: &Site, parts: &request::Parts) -> CorsOutcome {
        if !self.config.enabled {
            return CorsOutcome::NotApplicable;
        }
        let Some(origin_value) = parts.headers.get(ORIGIN) else {
            return CorsOutcome::NotApplicable;
        };
        let origin = origin_value.to_str().unwrap_or_default();
        let allowed = !origin.is_empty() && self.is_origin_allowed(origin, site);

        if Self::is_preflight(parts) {
            let mut headers = HeaderMap::new();
            if allowed {
                self.allow_origin(&mut headers, origin_value);
            } else {
                headers.append(VARY, HeaderValue::from_static("Origin"));
            }
            if let Some(methods) = &self.allow_methods {
                headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods.clone());
            }
            if let Some(allow_headers) = &self.allow_headers {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers.clone());
            }
            headers.insert(
                ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from(self.config.max_age.as_secs()),
            );
            return CorsOutcome::Preflight { headers, allowed };
        }

        if allowed {
            let mut headers = HeaderMap::new();
            self.allow_origin(&mut headers, origin_value);
            CorsOutcome::Allowed(headers)
        } else {
            CorsOutcome::Denied {
                origin: origin.to_owned(),
            }
        }
    }
}
