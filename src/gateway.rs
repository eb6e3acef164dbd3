//! Request admission: resolve the Site, then run the security gate
//!
//! [`SiteGateway`] is the one object a server builds at startup. It owns the
//! cache coordinator, the resolver, the security gate and the background
//! sweepers, and stops the sweepers on [`shutdown`](SiteGateway::shutdown).

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Response, request};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use crate::coordinator::{CacheCoordinator, HealthReport};
use crate::resolver::DomainResolver;
use crate::security::{Rejection, SecurityGate, Verdict};
use crate::site_cache::{Resolution, SiteBackend, SiteCache};
use crate::sweeper::Sweeper;
use crate::{GatewayError, ResolveError, Settings};

/// A request that may proceed
#[derive(Debug, Clone)]
pub struct Admitted {
    pub resolution: Resolution,
    pub verdict: Verdict,
}

impl Admitted {
    /// Attach cache and security headers to an outgoing response.
    pub fn apply_to(&self, target: &mut HeaderMap) {
        self.verdict.apply_to(target);
        target.extend(self.resolution.headers());
    }
}

/// Why a request was not admitted
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Rejected(#[from] Rejection),
}

impl AdmitError {
    pub fn into_response(self) -> Response<String> {
        match self {
            AdmitError::Rejected(rejection) => rejection.into_response(),
            AdmitError::Resolve(e) => {
                let body = json!({
                    "error": e.reason(),
                    "message": e.public_message(),
                    "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                });
                let mut response = Response::new(body.to_string());
                *response.status_mut() = e.status_code();
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
        }
    }
}

/// Site resolution and security enforcement for every inbound request
pub struct SiteGateway<B: SiteBackend> {
    sites: SiteCache<B>,
    gate: SecurityGate,
    sweepers: Mutex<Vec<Sweeper>>,
}

impl<B: SiteBackend> SiteGateway<B> {
    /// Build everything from `settings` and start the cleanup sweepers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: &Settings, backend: B) -> Result<Self, GatewayError> {
        let coordinator = Arc::new(CacheCoordinator::from_config(&settings.cache)?);
        let resolver = DomainResolver::new(settings.resolver.clone());
        let gate = SecurityGate::new(&settings.security)?;

        let mut sweepers = Vec::new();
        if let Some(local) = coordinator.local_cache() {
            sweepers.push(local.spawn_cleanup(settings.cache.cleanup_interval));
        }
        if settings.security.rate_limit.enabled {
            sweepers.push(gate.rate_limiter().spawn_cleanup());
        }

        info!(
            "Site gateway ready (cache: {}, environment: {}, platform domain: {})",
            coordinator.provider(),
            settings.security.environment,
            settings.resolver.platform_domain
        );
        Ok(Self {
            sites: SiteCache::new(coordinator, resolver, backend),
            gate,
            sweepers: Mutex::new(sweepers),
        })
    }

    pub fn sites(&self) -> &SiteCache<B> {
        &self.sites
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub async fn health(&self) -> HealthReport {
        self.sites.coordinator().health_check().await
    }

    /// Resolve the request's Site and run the security gate against it.
    pub async fn admit(&self, parts: &request::Parts) -> Result<Admitted, AdmitError> {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| parts.uri.host())
            .unwrap_or_default();

        let resolution = self.sites.resolve_host(host).await?;
        debug!(
            "Resolved {} to site {} ({} via {})",
            host, resolution.site.id, resolution.cache, resolution.provider
        );
        let verdict = self.gate.evaluate(&resolution.site, parts)?;
        Ok(Admitted {
            resolution,
            verdict,
        })
    }

    /// Stop background sweepers. Idempotent.
    pub async fn shutdown(&self) {
        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        for sweeper in sweepers {
            debug!("Stopping {}", sweeper.name());
            sweeper.shutdown().await;
        }
    }
}
