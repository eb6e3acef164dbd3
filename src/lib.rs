//! sitegate - Tenant site resolution and per-tenant request security
//!
//! Every inbound request is mapped to a tenant [`Site`] by subdomain or
//! custom domain, then checked by a four-stage [`SecurityGate`]:
//! - CORS origin checks (including preflight handling)
//! - fixed-window rate limiting per Site and client
//! - double-submit CSRF tokens signed with HMAC-SHA256
//! - response hardening headers (CSP, HSTS, frame options, ...)
//!
//! Site lookups go through a two-tier cache:
//! - a distributed tier (Redis, or a Redis-over-HTTP proxy) shared across
//!   instances
//! - an in-process fallback tier that takes over transparently while the
//!   distributed tier is unreachable
//!
//! [`SiteGateway`] wires the pieces together from [`Settings`].

mod codec;
mod config;
mod coordinator;
mod distributed;
mod error;
mod gateway;
mod local_cache;
mod metrics;
mod resolver;
pub mod security;
mod site;
mod site_cache;
mod store;
mod sweeper;

pub use codec::{Codec, JsonCodec};
pub use config::{CacheConfig, ResolverConfig, Settings};
pub use coordinator::{CacheCoordinator, HealthReport, HealthStatus, Served};
pub use distributed::{ConnectionPolicy, DistributedCache, HttpTransport, RedisTransport, Transport};
pub use error::{CacheError, GatewayError, ResolveError};
pub use gateway::{AdmitError, Admitted, SiteGateway};
pub use local_cache::{CacheEntry, LocalCache};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use resolver::{DomainLookup, DomainResolver, DomainType};
pub use security::{
    CsrfFailure, CsrfGuard, RateLimiter, Rejection, SecurityConfig, SecurityGate, Verdict,
};
pub use site::Site;
pub use site_cache::{CacheStatus, Resolution, SiteBackend, SiteCache};
pub use store::{CacheProvider, CacheStore, Cacheable};
pub use sweeper::Sweeper;

// Re-export async_trait for SiteBackend implementors
pub use async_trait::async_trait;
