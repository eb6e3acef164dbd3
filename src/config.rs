//! Cache and resolver configuration
//!
//! Every setting can be overridden from the environment (`SITEGATE_*`).
//! Unparsable values fall back to the default and log a warning.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::security::SecurityConfig;

/// Configuration for the two-tier site cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Distributed store URL. `redis://`/`rediss://` selects the native
    /// transport, `http://`/`https://` the REST proxy. `None` runs memory-only.
    pub url: Option<String>,
    /// Bearer token for the REST proxy transport
    pub token: Option<String>,
    /// Connection attempts before the distributed tier is marked down
    pub max_retries: u32,
    /// Initial delay between connection attempts (doubles per attempt)
    pub retry_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_retry_delay: Duration,
    /// How long a down tier fails fast before a new connection cycle
    pub down_cooldown: Duration,
    /// Per-operation deadline for distributed calls
    pub operation_timeout: Duration,
    /// Namespace prepended to every cache key
    pub key_prefix: String,
    /// Serve from the in-process tier when the distributed tier fails
    pub fallback_to_memory: bool,
    /// Maximum number of entries in the in-process tier
    pub local_max_size: usize,
    /// Period of the in-process expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
            down_cooldown: Duration::from_secs(30),
            operation_timeout: Duration::from_millis(500),
            key_prefix: "site:".to_owned(),
            fallback_to_memory: true,
            local_max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Load from `SITEGATE_CACHE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_string("SITEGATE_CACHE_URL"),
            token: env_string("SITEGATE_CACHE_TOKEN"),
            max_retries: env_parse("SITEGATE_CACHE_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_millis(env_parse(
                "SITEGATE_CACHE_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
            max_retry_delay: defaults.max_retry_delay,
            down_cooldown: defaults.down_cooldown,
            operation_timeout: Duration::from_millis(env_parse(
                "SITEGATE_CACHE_TIMEOUT_MS",
                defaults.operation_timeout.as_millis() as u64,
            )),
            key_prefix: env_string("SITEGATE_CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            fallback_to_memory: env_bool("SITEGATE_CACHE_FALLBACK", defaults.fallback_to_memory),
            local_max_size: env_parse("SITEGATE_CACHE_LOCAL_MAX_SIZE", defaults.local_max_size),
            cleanup_interval: Duration::from_secs(env_parse(
                "SITEGATE_CACHE_CLEANUP_SECS",
                defaults.cleanup_interval.as_secs(),
            )),
        }
    }
}

/// Configuration for host classification and the TTL policy
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Namespace prepended to every cache key
    pub key_prefix: String,
    /// Root domain tenants get subdomains of (e.g. `example-platform.com`)
    pub platform_domain: String,
    /// Subdomain labels that never belong to a tenant
    pub reserved_subdomains: Vec<String>,
    /// TTL for subdomain lookups
    pub subdomain_ttl: Duration,
    /// TTL for custom-domain lookups
    pub custom_domain_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            key_prefix: "site:".to_owned(),
            platform_domain: "localhost".to_owned(),
            reserved_subdomains: ["www", "app", "api", "admin", "dashboard"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            subdomain_ttl: Duration::from_secs(300),
            custom_domain_ttl: Duration::from_secs(3600),
        }
    }
}

impl ResolverConfig {
    /// Load from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            key_prefix: env_string("SITEGATE_CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            platform_domain: env_string("SITEGATE_PLATFORM_DOMAIN")
                .map(|d| d.trim_start_matches('.').to_lowercase())
                .unwrap_or(defaults.platform_domain),
            reserved_subdomains: env_list("SITEGATE_RESERVED_SUBDOMAINS")
                .unwrap_or(defaults.reserved_subdomains),
            subdomain_ttl: Duration::from_secs(env_parse(
                "SITEGATE_SUBDOMAIN_TTL_SECS",
                defaults.subdomain_ttl.as_secs(),
            )),
            custom_domain_ttl: Duration::from_secs(env_parse(
                "SITEGATE_CUSTOM_DOMAIN_TTL_SECS",
                defaults.custom_domain_ttl.as_secs(),
            )),
        }
    }
}

/// Process-wide settings, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub security: SecurityConfig,
}

impl Settings {
    pub fn from_env() -> Self {
        let resolver = ResolverConfig::from_env();
        let security = SecurityConfig::from_env(&resolver.platform_domain);
        Self {
            cache: CacheConfig::from_env(),
            resolver,
            security,
        }
    }
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparsable value for {}: {:?}", name, raw);
                default
            }
        },
        None => default,
    }
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).map(|s| s.to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!("Ignoring unparsable boolean for {}: {:?}", name, v);
            default
        }
        None => default,
    }
}

/// Comma-separated list; `None` when unset.
pub(crate) fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|s| {
        s.split(',')
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect()
    })
}
