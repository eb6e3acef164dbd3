//! Cache and resolution error types

use std::time::Duration;

use http::StatusCode;
use redis::RedisError;

/// Cache-related errors
///
/// Everything here is recoverable from the caller's point of view: the
/// coordinator counts it, logs it and serves the request from the local tier
/// when fallback is enabled.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("HTTP cache proxy error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Distributed cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache proxy returned an error: {0}")]
    Remote(String),

    #[error("Invalid cache configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the error means the connection itself is gone and should be
    /// re-established before the next operation.
    pub fn is_connection_error(&self) -> bool {
        match self {
            CacheError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            CacheError::Http(e) => e.is_connect() || e.is_timeout(),
            CacheError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short classification that is safe to expose in health output.
    ///
    /// Never includes hosts, URLs or credentials.
    pub fn public_message(&self) -> &'static str {
        match self {
            CacheError::Redis(e) if e.is_connection_refusal() => "connection refused",
            CacheError::Redis(e) if e.is_timeout() => "timeout",
            CacheError::Redis(_) => "redis error",
            CacheError::Http(e) if e.is_timeout() => "timeout",
            CacheError::Http(e) if e.is_connect() => "connection refused",
            CacheError::Http(_) => "proxy error",
            CacheError::Serialization(_) | CacheError::Codec(_) => "malformed value",
            CacheError::Timeout(_) => "timeout",
            CacheError::Unavailable(_) => "unavailable",
            CacheError::Remote(_) => "proxy error",
            CacheError::Config(_) => "misconfigured",
        }
    }
}

/// Startup errors for the assembled gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Invalid security configuration: {0}")]
    Security(String),
}

/// Errors produced while resolving a request host to a Site.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The cache failed and no fallback tier is configured.
    #[error("Site cache unavailable: {0}")]
    Cache(#[from] CacheError),

    /// The external data layer failed to load the Site.
    #[error("Site backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// No Site is registered for the host.
    #[error("No site found for host {0}")]
    NotFound(String),
}

impl ResolveError {
    /// HTTP status a gateway should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResolveError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            ResolveError::Backend(_) => StatusCode::BAD_GATEWAY,
            ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Machine-readable reason for client error bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            ResolveError::Cache(_) => "cache_unavailable",
            ResolveError::Backend(_) => "site_lookup_failed",
            ResolveError::NotFound(_) => "site_not_found",
        }
    }

    /// Client-facing message; never includes internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            ResolveError::Cache(_) => "Site resolution is temporarily unavailable",
            ResolveError::Backend(_) => "Site lookup failed",
            ResolveError::NotFound(_) => "No site is configured for this host",
        }
    }
}
