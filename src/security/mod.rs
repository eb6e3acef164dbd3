//! Per-request security enforcement for resolved Sites
//!
//! [`SecurityGate`] runs four stages in a fixed order: CORS, rate limiting,
//! CSRF, response hardening headers. The first three may reject the request;
//! the last always contributes headers. Configuration is loaded once at
//! startup and never mutated.

mod cors;
mod csrf;
mod gate;
mod headers;
mod rate_limit;

pub use cors::{CorsOutcome, CorsPolicy};
pub use csrf::{CsrfFailure, CsrfGuard};
pub use gate::{Rejection, SecurityGate, Verdict};
pub use headers::SecurityHeaders;
pub use rate_limit::{KeyStrategy, RateLimitDecision, RateLimitEntry, RateLimiter, client_ip};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{env_bool, env_list, env_parse, env_string};

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Preview,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Preview => "preview",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "preview" | "staging" => Ok(Environment::Preview),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSRF double-submit settings
#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub enabled: bool,
    /// HMAC key. A random per-process key is generated when unset, which
    /// invalidates issued tokens on restart and across instances.
    pub secret: Option<String>,
    pub cookie_name: String,
    pub header_name: String,
    /// Path prefixes that skip verification (webhooks, health probes)
    pub exempt_paths: Vec<String>,
    pub token_validity: Duration,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: None,
            cookie_name: "csrf_token".to_owned(),
            header_name: "x-csrf-token".to_owned(),
            exempt_paths: Vec::new(),
            token_validity: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Cross-origin settings
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    /// `*`, exact origins, or `*.domain` wildcards. Each Site's own origins
    /// are always allowed in addition.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            allowed_headers: ["content-type", "authorization", "x-csrf-token", "x-requested-with"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            allow_credentials: false,
            max_age: Duration::from_secs(86400),
        }
    }
}

/// Fixed-window rate limit settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window: Duration,
    pub max_requests: u32,
    pub key: KeyStrategy,
    /// Period of the sweep that drops elapsed windows
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
            key: KeyStrategy::SiteIp,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Which hardening headers to emit
#[derive(Debug, Clone)]
pub struct HeaderConfig {
    /// HSTS; only ever sent in production
    pub hsts: bool,
    pub hsts_max_age: Duration,
    pub csp: bool,
    pub frame_options: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            hsts: true,
            hsts_max_age: Duration::from_secs(31_536_000),
            csp: true,
            frame_options: true,
        }
    }
}

/// Everything the security pipeline reads
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub environment: Environment,
    pub platform_domain: String,
    /// Companion dashboard allowed to frame tenant sites
    pub dashboard_origin: Option<String>,
    pub csrf: CsrfConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub headers: HeaderConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            platform_domain: "localhost".to_owned(),
            dashboard_origin: None,
            csrf: CsrfConfig::default(),
            cors: CorsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            headers: HeaderConfig::default(),
        }
    }
}

impl SecurityConfig {
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Load from `SITEGATE_*` environment variables.
    pub fn from_env(platform_domain: &str) -> Self {
        let defaults = Self::default();
        let csrf = CsrfConfig {
            enabled: env_bool("SITEGATE_CSRF_ENABLED", defaults.csrf.enabled),
            secret: env_string("SITEGATE_CSRF_SECRET"),
            cookie_name: env_string("SITEGATE_CSRF_COOKIE").unwrap_or(defaults.csrf.cookie_name),
            header_name: env_string("SITEGATE_CSRF_HEADER")
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or(defaults.csrf.header_name),
            exempt_paths: env_list("SITEGATE_CSRF_EXEMPT_PATHS").unwrap_or_default(),
            token_validity: defaults.csrf.token_validity,
        };
        let cors = CorsConfig {
            enabled: env_bool("SITEGATE_CORS_ENABLED", defaults.cors.enabled),
            allowed_origins: env_list("SITEGATE_CORS_ORIGINS").unwrap_or_default(),
            allow_credentials: env_bool(
                "SITEGATE_CORS_ALLOW_CREDENTIALS",
                defaults.cors.allow_credentials,
            ),
            max_age: Duration::from_secs(env_parse(
                "SITEGATE_CORS_MAX_AGE_SECS",
                defaults.cors.max_age.as_secs(),
            )),
            ..defaults.cors
        };
        let rate_limit = RateLimitConfig {
            enabled: env_bool("SITEGATE_RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
            window: Duration::from_secs(
                env_parse(
                    "SITEGATE_RATE_LIMIT_WINDOW_SECS",
                    defaults.rate_limit.window.as_secs(),
                )
                .max(1),
            ),
            max_requests: env_parse(
                "SITEGATE_RATE_LIMIT_MAX_REQUESTS",
                defaults.rate_limit.max_requests,
            ),
            key: env_parse("SITEGATE_RATE_LIMIT_KEY", defaults.rate_limit.key),
            ..defaults.rate_limit
        };
        let headers = HeaderConfig {
            hsts: env_bool("SITEGATE_HSTS", defaults.headers.hsts),
            csp: env_bool("SITEGATE_CSP", defaults.headers.csp),
            frame_options: env_bool("SITEGATE_FRAME_OPTIONS", defaults.headers.frame_options),
            ..defaults.headers
        };

        Self {
            environment: env_parse("SITEGATE_ENV", defaults.environment),
            platform_domain: platform_domain.to_owned(),
            dashboard_origin: env_string("SITEGATE_DASHBOARD_ORIGIN")
                .map(|o| o.trim_end_matches('/').to_owned()),
            csrf,
            cors,
            rate_limit,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("PRODUCTION".parse(), Ok(Environment::Production));
        assert_eq!("staging".parse(), Ok(Environment::Preview));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_secure_defaults() {
        let config = SecurityConfig::default();
        assert!(config.csrf.enabled);
        assert!(config.cors.enabled);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.key, KeyStrategy::SiteIp);
        assert_eq!(config.csrf.token_validity, Duration::from_secs(86400));
        assert!(!config.is_production());
    }

    #[test]
    fn test_from_env() {
        // Variables are process-wide; this is the only test that sets them.
        unsafe {
            std::env::set_var("SITEGATE_ENV", "production");
            std::env::set_var("SITEGATE_RATE_LIMIT_KEY", "ip");
            std::env::set_var("SITEGATE_CORS_ORIGINS", "https://a.example.com, *.partner.io");
            std::env::set_var("SITEGATE_DASHBOARD_ORIGIN", "https://dash.example-platform.com/");
        }
        let config = SecurityConfig::from_env("example-platform.com");
        assert!(config.is_production());
        assert_eq!(config.rate_limit.key, KeyStrategy::Ip);
        assert_eq!(
            config.cors.allowed_origins,
            vec!["https://a.example.com", "*.partner.io"]
        );
        assert_eq!(
            config.dashboard_origin.as_deref(),
            Some("https://dash.example-platform.com")
        );
        assert_eq!(config.platform_domain, "example-platform.com");
    }
}
