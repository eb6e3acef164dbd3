//! Site resolution by subdomain or custom domain
//!
//! [`SiteCache`] turns a request host into a [`Site`]: classify the host,
//! look it up through the [`CacheCoordinator`], and on a miss load it from
//! the [`SiteBackend`] and write it back with the TTL for its domain type.
//! The data layer calls [`SiteCache::invalidate`] whenever it changes a Site.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coordinator::CacheCoordinator;
use crate::resolver::{DomainLookup, DomainResolver, DomainType};
use crate::store::CacheProvider;
use crate::{CacheError, ResolveError, Site};

pub const SITE_CACHE_HEADER: HeaderName = HeaderName::from_static("x-site-cache");
pub const CACHE_PROVIDER_HEADER: HeaderName = HeaderName::from_static("x-cache-provider");
pub const CACHE_LATENCY_HEADER: HeaderName = HeaderName::from_static("x-cache-latency");

/// Loads Sites from the system of record
///
/// Implemented by the external data layer (database, admin API, ...).
#[async_trait]
pub trait SiteBackend: Send + Sync + 'static {
    /// Fetch site by subdomain label
    async fn fetch_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Site>, Box<dyn std::error::Error + Send + Sync>>;

    /// Fetch site by verified custom domain
    async fn fetch_by_custom_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Site>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Whether the cache answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved Site and how it was found
#[derive(Debug, Clone)]
pub struct Resolution {
    pub site: Arc<Site>,
    pub lookup: DomainLookup,
    pub cache: CacheStatus,
    /// Tier that answered the lookup, hit or miss
    pub provider: CacheProvider,
    pub latency: Duration,
}

impl Resolution {
    /// `X-Site-Cache`, `X-Cache-Provider` and `X-Cache-Latency`
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SITE_CACHE_HEADER, HeaderValue::from_static(self.cache.as_str()));
        headers.insert(
            CACHE_PROVIDER_HEADER,
            HeaderValue::from_static(self.provider.as_str()),
        );
        let latency = format!("{}ms", self.latency.as_millis());
        if let Ok(value) = HeaderValue::from_str(&latency) {
            headers.insert(CACHE_LATENCY_HEADER, value);
        }
        headers
    }
}

/// Cache-aside Site lookup
pub struct SiteCache<B: SiteBackend> {
    coordinator: Arc<CacheCoordinator<Site>>,
    resolver: DomainResolver,
    backend: Arc<B>,
}

impl<B: SiteBackend> Clone for SiteCache<B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            resolver: self.resolver.clone(),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: SiteBackend> SiteCache<B> {
    pub fn new(coordinator: Arc<CacheCoordinator<Site>>, resolver: DomainResolver, backend: B) -> Self {
        Self {
            coordinator,
            resolver,
            backend: Arc::new(backend),
        }
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator<Site>> {
        &self.coordinator
    }

    pub fn resolver(&self) -> &DomainResolver {
        &self.resolver
    }

    /// Resolve a `Host` header value.
    pub async fn resolve_host(&self, host: &str) -> Result<Resolution, ResolveError> {
        let lookup = self
            .resolver
            .classify_host(host)
            .ok_or_else(|| ResolveError::NotFound(DomainResolver::normalize(host)))?;
        self.resolve(lookup).await
    }

    /// Resolve an already-classified lookup.
    ///
    /// Inactive Sites are cached like any other but reported as not found.
    pub async fn resolve(&self, lookup: DomainLookup) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let key = self.resolver.cache_key(&lookup.value, lookup.domain_type);
        let served = self.coordinator.get_served(&key).await?;

        let (site, cache) = match served.value {
            Some(site) => (site, CacheStatus::Hit),
            None => (self.load(&key, &lookup).await?, CacheStatus::Miss),
        };

        if !site.active {
            debug!("Site {} for {} is inactive", site.id, lookup.value);
            return Err(ResolveError::NotFound(lookup.value));
        }

        Ok(Resolution {
            site,
            lookup,
            cache,
            provider: served.provider,
            latency: started.elapsed(),
        })
    }

    async fn load(&self, key: &str, lookup: &DomainLookup) -> Result<Arc<Site>, ResolveError> {
        let fetched = match lookup.domain_type {
            DomainType::Subdomain => self.backend.fetch_by_subdomain(&lookup.value).await,
            DomainType::CustomDomain => self.backend.fetch_by_custom_domain(&lookup.value).await,
        }
        .map_err(ResolveError::Backend)?;

        let site = Arc::new(fetched.ok_or_else(|| ResolveError::NotFound(lookup.value.clone()))?);
        let ttl = self.resolver.ttl_for(lookup.domain_type);
        // The loaded Site is correct regardless; a failed write-back only
        // costs another backend fetch.
        if let Err(e) = self.coordinator.set(key, Arc::clone(&site), ttl).await {
            warn!("Failed to cache site {} under {}: {}", site.id, key, e);
        }
        debug!("Loaded site {} for {} {}", site.id, lookup.domain_type, lookup.value);
        Ok(site)
    }

    /// Drop every cached entry for `site`.
    pub async fn invalidate(&self, site: &Site) -> Result<(), CacheError> {
        for key in self.resolver.invalidation_keys(site) {
            debug!("Invalidating site {} key {}", site.id, key);
            self.coordinator.delete(&key).await?;
        }
        Ok(())
    }

    /// Cache a batch of Sites under all their keys, one round trip per
    /// domain type.
    pub async fn warm(&self, sites: &[Site]) -> Result<(), CacheError> {
        let mut subdomains = Vec::with_capacity(sites.len());
        let mut custom_domains = Vec::new();
        for site in sites {
            let site = Arc::new(site.clone());
            if let Some(domain) = site.custom_domain.as_deref() {
                custom_domains.push((
                    self.resolver.cache_key(domain, DomainType::CustomDomain),
                    Arc::clone(&site),
                ));
            }
            subdomains.push((
                self.resolver.cache_key(&site.subdomain, DomainType::Subdomain),
                site,
            ));
        }
        for (domain_type, entries) in [
            (DomainType::Subdomain, subdomains),
            (DomainType::CustomDomain, custom_domains),
        ] {
            if !entries.is_empty() {
                self.coordinator
                    .mset(&entries, self.resolver.ttl_for(domain_type))
                    .await?;
            }
        }
        Ok(())
    }
}
