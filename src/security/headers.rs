//! Response hardening headers

use http::header::{
    CONTENT_SECURITY_POLICY, REFERRER_POLICY, SERVER, STRICT_TRANSPORT_SECURITY,
    X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use http::{HeaderMap, HeaderName, HeaderValue};

use super::{Environment, SecurityConfig};
use crate::Site;

const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");
const X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

/// Directives shared by every Site; `frame-ancestors` is appended per Site.
const BASE_CSP: &str = "default-src 'self'; \
    script-src 'self' 'unsafe-inline'; \
    style-src 'self' 'unsafe-inline'; \
    img-src 'self' data: https:; \
    font-src 'self' data:; \
    connect-src 'self'; \
    object-src 'none'; \
    base-uri 'self'; \
    form-action 'self'";

/// Builds the per-Site hardening headers
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    environment: Environment,
    platform_domain: String,
    dashboard_origin: Option<String>,
    hsts: Option<HeaderValue>,
    csp: bool,
    frame_options: bool,
}

impl SecurityHeaders {
    pub fn new(config: &SecurityConfig) -> Self {
        let hsts = if config.headers.hsts && config.is_production() {
            HeaderValue::try_from(format!(
                "max-age={}; includeSubDomains",
                config.headers.hsts_max_age.as_secs()
            ))
            .ok()
        } else {
            None
        };
        Self {
            environment: config.environment,
            platform_domain: config.platform_domain.clone(),
            dashboard_origin: config.dashboard_origin.clone(),
            hsts,
            csp: config.headers.csp,
            frame_options: config.headers.frame_options,
        }
    }

    /// Who may embed `site`: itself, the dashboard (for live previews), the
    /// Site's other hosts, and local dev servers in development.
    pub fn frame_ancestors(&self, site: &Site) -> String {
        let mut sources = vec!["'self'".to_owned()];
        if let Some(dashboard) = &self.dashboard_origin {
            sources.push(dashboard.clone());
        }
        for origin in site.origins(&self.platform_domain) {
            if !sources.contains(&origin) {
                sources.push(origin);
            }
        }
        if self.environment == Environment::Development {
            sources.push("http://localhost:*".to_owned());
        }
        sources.join(" ")
    }

    pub fn content_security_policy(&self, site: &Site) -> String {
        format!("{}; frame-ancestors {}", BASE_CSP, self.frame_ancestors(site))
    }

    pub fn compose(&self, site: &Site) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(hsts) = &self.hsts {
            headers.insert(STRICT_TRANSPORT_SECURITY, hsts.clone());
        }
        if self.csp
            && let Ok(csp) = HeaderValue::from_str(&self.content_security_policy(site))
        {
            headers.insert(CONTENT_SECURITY_POLICY, csp);
        }
        if self.frame_options {
            headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
        }
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        headers.insert(
            PERMISSIONS_POLICY,
            HeaderValue::from_static("camera=(), microphone=(), geolocation=(), payment=()"),
        );
        headers
    }
}

/// Remove headers that reveal the serving stack.
pub(crate) fn strip_identifying(headers: &mut HeaderMap) {
    headers.remove(SERVER);
    headers.remove(X_POWERED_BY);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(environment: Environment) -> SecurityConfig {
        SecurityConfig {
            environment,
            platform_domain: "example-platform.com".into(),
            dashboard_origin: Some("https://dashboard.example-platform.com".into()),
            ..SecurityConfig::default()
        }
    }

    fn acme() -> Site {
        Site::new("s1", "acme").with_custom_domain("shop.example.com")
    }

    #[test]
    fn test_hsts_only_in_production() {
        let prod = SecurityHeaders::new(&config(Environment::Production)).compose(&acme());
        assert_eq!(
            prod[STRICT_TRANSPORT_SECURITY],
            "max-age=31536000; includeSubDomains"
        );

        let preview = SecurityHeaders::new(&config(Environment::Preview)).compose(&acme());
        assert!(!preview.contains_key(STRICT_TRANSPORT_SECURITY));
    }

    #[test]
    fn test_frame_ancestors() {
        let headers = SecurityHeaders::new(&config(Environment::Production));
        assert_eq!(
            headers.frame_ancestors(&acme()),
            "'self' https://dashboard.example-platform.com \
             https://acme.example-platform.com https://shop.example.com"
        );

        let dev = SecurityHeaders::new(&config(Environment::Development));
        assert!(dev.frame_ancestors(&acme()).ends_with("http://localhost:*"));
    }

    #[test]
    fn test_fixed_headers() {
        let headers = SecurityHeaders::new(&config(Environment::Production)).compose(&acme());
        assert_eq!(headers[X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(headers[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[REFERRER_POLICY], "strict-origin-when-cross-origin");
        assert!(headers.contains_key(PERMISSIONS_POLICY));
        let csp = headers[CONTENT_SECURITY_POLICY].to_str().unwrap();
        assert!(csp.starts_with("default-src 'self';"));
        assert!(csp.contains("frame-ancestors 'self'"));
    }

    #[test]
    fn test_optional_headers_can_be_disabled() {
        let mut config = config(Environment::Production);
        config.headers.csp = false;
        config.headers.frame_options = false;
        config.headers.hsts = false;
        let headers = SecurityHeaders::new(&config).compose(&acme());
        assert!(!headers.contains_key(CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(X_FRAME_OPTIONS));
        assert!(!headers.contains_key(STRICT_TRANSPORT_SECURITY));
        assert!(headers.contains_key(X_CONTENT_TYPE_OPTIONS));
    }

    #[test]
    fn test_strip_identifying() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static("nginx/1.25"));
        headers.insert(X_POWERED_BY, HeaderValue::from_static("Express"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        strip_identifying(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
