//! Failover between the distributed and in-process tiers
//!
//! Every call goes to the primary store first. When that store is the
//! distributed tier and the call fails (timeout, refused connection, corrupt
//! value), the error is counted and logged and, if fallback is enabled, the
//! same operation runs against the [`LocalCache`]. Callers get the same
//! return type either way. With fallback disabled the error propagates: no
//! cache is preferred over a silently inconsistent one.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::distributed::{ConnectionPolicy, DistributedCache, HttpTransport, RedisTransport};
use crate::local_cache::LocalCache;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::store::{CacheProvider, CacheStore, Cacheable};
use crate::{CacheConfig, CacheError};

/// Overall cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health endpoint payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub provider: CacheProvider,
    pub distributed_reachable: bool,
    pub local_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// A value together with the tier that produced it
#[derive(Debug, Clone)]
pub struct Served<T> {
    pub value: T,
    pub provider: CacheProvider,
}

/// Entry point for all cache traffic
pub struct CacheCoordinator<V: Cacheable> {
    primary: Arc<dyn CacheStore<V>>,
    /// Set only when `primary` is the distributed tier and fallback is on
    fallback: Option<Arc<LocalCache<V>>>,
    /// The in-process tier, whether it is primary or fallback
    local: Option<Arc<LocalCache<V>>>,
    distributed: bool,
    /// Why a configured distributed tier is not in use
    startup_error: Option<&'static str>,
    metrics: CacheMetrics,
}

impl<V: Cacheable> CacheCoordinator<V> {
    /// In-process only.
    pub fn memory(local: Arc<LocalCache<V>>) -> Self {
        Self {
            primary: local.clone(),
            fallback: None,
            local: Some(local),
            distributed: false,
            startup_error: None,
            metrics: CacheMetrics::default(),
        }
    }

    /// Distributed primary with an optional in-process fallback.
    pub fn distributed(store: Arc<dyn CacheStore<V>>, fallback: Option<Arc<LocalCache<V>>>) -> Self {
        Self {
            primary: store,
            local: fallback.clone(),
            fallback,
            distributed: true,
            startup_error: None,
            metrics: CacheMetrics::default(),
        }
    }

    /// Build the coordinator selected by `config`.
    ///
    /// A URL that cannot be turned into a transport is fatal only when
    /// fallback is disabled; otherwise the process runs memory-only and
    /// health reports `degraded`.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let local = Arc::new(LocalCache::new(config.local_max_size));
        let Some(url) = config.url.as_deref() else {
            info!("No distributed cache configured; using in-process cache only");
            return Ok(Self::memory(local));
        };

        match Self::distributed_store(url, config) {
            Ok(store) => {
                info!(
                    "Using {} cache (fallback to memory: {})",
                    store.provider(),
                    config.fallback_to_memory
                );
                let fallback = config.fallback_to_memory.then_some(local);
                Ok(Self::distributed(store, fallback))
            }
            Err(e) if config.fallback_to_memory => {
                error!(
                    "Distributed cache setup failed ({}); continuing with in-process cache only",
                    e.public_message()
                );
                let mut coordinator = Self::memory(local);
                coordinator.startup_error = Some(e.public_message());
                Ok(coordinator)
            }
            Err(e) => Err(e),
        }
    }

    fn distributed_store(
        url: &str,
        config: &CacheConfig,
    ) -> Result<Arc<dyn CacheStore<V>>, CacheError> {
        let policy = ConnectionPolicy::from(config);
        let prefix = config.key_prefix.clone();
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            let transport = RedisTransport::open(url)?;
            Ok(Arc::new(DistributedCache::<V, _>::new(transport, policy, prefix)))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            let transport = HttpTransport::new(url, config.token.clone(), config.operation_timeout)?;
            Ok(Arc::new(DistributedCache::<V, _>::new(transport, policy, prefix)))
        } else {
            // The URL may carry credentials; keep it out of the error.
            Err(CacheError::Config("unsupported cache URL scheme".into()))
        }
    }

    /// The tier that serves requests while everything is healthy
    pub fn provider(&self) -> CacheProvider {
        self.primary.provider()
    }

    /// The in-process tier, for starting its cleanup sweep
    pub fn local_cache(&self) -> Option<&Arc<LocalCache<V>>> {
        self.local.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Count the failure and pick the fallback tier, or give the error back.
    fn fallback_for(&self, op: &str, key: &str, err: CacheError) -> Result<&LocalCache<V>, CacheError> {
        self.metrics.record_error();
        match &self.fallback {
            Some(local) => {
                warn!(
                    "{} cache {} failed for key {}: {}. Falling back to memory.",
                    self.primary.provider(),
                    op,
                    key,
                    err
                );
                Ok(local.as_ref())
            }
            None => {
                error!(
                    "{} cache {} failed for key {}: {}. No fallback configured.",
                    self.primary.provider(),
                    op,
                    key,
                    err
                );
                Err(err)
            }
        }
    }

    fn record_lookup(&self, found: bool, key: &str, provider: CacheProvider) {
        if found {
            debug!("Cache hit ({}) for key: {}", provider, key);
            self.metrics.record_hit();
        } else {
            debug!("Cache miss ({}) for key: {}", provider, key);
            self.metrics.record_miss();
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        Ok(self.get_served(key).await?.value)
    }

    /// Like [`get`](Self::get), also reporting which tier answered.
    pub async fn get_served(&self, key: &str) -> Result<Served<Option<Arc<V>>>, CacheError> {
        self.metrics.record_operation();
        let started = Instant::now();
        let served = match self.primary.get(key).await {
            Ok(value) => {
                self.metrics.record_latency(started.elapsed());
                Served {
                    value,
                    provider: self.primary.provider(),
                }
            }
            Err(e) => Served {
                value: self.fallback_for("get", key, e)?.get(key),
                provider: CacheProvider::Memory,
            },
        };
        self.record_lookup(served.value.is_some(), key, served.provider);
        Ok(served)
    }

    pub async fn set(&self, key: &str, value: Arc<V>, ttl: Duration) -> Result<(), CacheError> {
        self.metrics.record_operation();
        let started = Instant::now();
        match self.primary.set(key, Arc::clone(&value), ttl).await {
            Ok(()) => {
                self.metrics.record_latency(started.elapsed());
                Ok(())
            }
            Err(e) => {
                self.fallback_for("set", key, e)?.set(key, value, ttl);
                Ok(())
            }
        }
    }

    /// Delete from the primary and from the fallback tier, so an entry
    /// written during an earlier outage cannot resurface in the next one.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.metrics.record_operation();
        let started = Instant::now();
        let result = self.primary.delete(key).await;
        if let Some(local) = &self.fallback {
            local.delete(key);
        }
        match result {
            Ok(()) => {
                self.metrics.record_latency(started.elapsed());
                Ok(())
            }
            Err(e) => self.fallback_for("delete", key, e).map(|_| ()),
        }
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.metrics.record_operation();
        let result = self.primary.clear().await;
        if let Some(local) = &self.fallback {
            local.clear();
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fallback_for("clear", "*", e).map(|_| ()),
        }
    }

    /// Batch get in one round trip; falls back for the whole batch.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Arc<V>>>, CacheError> {
        self.metrics.record_operation();
        let started = Instant::now();
        let (values, provider) = match self.primary.mget(keys).await {
            Ok(values) => {
                self.metrics.record_latency(started.elapsed());
                (values, self.primary.provider())
            }
            Err(e) => {
                let local = self.fallback_for("mget", &format!("[{} keys]", keys.len()), e)?;
                (keys.iter().map(|key| local.get(key)).collect(), CacheProvider::Memory)
            }
        };
        for (key, value) in keys.iter().zip(&values) {
            self.record_lookup(value.is_some(), key, provider);
        }
        Ok(values)
    }

    /// Batch set in one round trip; falls back for the whole batch.
    pub async fn mset(&self, entries: &[(String, Arc<V>)], ttl: Duration) -> Result<(), CacheError> {
        self.metrics.record_operation();
        let started = Instant::now();
        match self.primary.mset(entries, ttl).await {
            Ok(()) => {
                self.metrics.record_latency(started.elapsed());
                Ok(())
            }
            Err(e) => {
                let local =
                    self.fallback_for("mset", &format!("[{} keys]", entries.len()), e)?;
                for (key, value) in entries {
                    local.set(key, Arc::clone(value), ttl);
                }
                Ok(())
            }
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let metrics = self.metrics.snapshot();
        if !self.distributed {
            return HealthReport {
                status: if self.startup_error.is_some() {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                provider: CacheProvider::Memory,
                distributed_reachable: false,
                local_available: true,
                latency_ms: None,
                error: self.startup_error.map(str::to_owned),
                metrics,
            };
        }

        match self.primary.ping().await {
            Ok(latency) => HealthReport {
                status: HealthStatus::Healthy,
                provider: self.primary.provider(),
                distributed_reachable: true,
                local_available: self.fallback.is_some(),
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                error: None,
                metrics,
            },
            Err(e) => HealthReport {
                status: if self.fallback.is_some() {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Unhealthy
                },
                provider: self.primary.provider(),
                distributed_reachable: false,
                local_available: self.fallback.is_some(),
                latency_ms: None,
                error: Some(e.public_message().to_owned()),
                metrics,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Site;
    use crate::distributed::testing::{FakeTransport, policy};

    fn acme() -> Arc<Site> {
        Arc::new(Site::new("s1", "acme"))
    }

    fn with_transport(
        transport: FakeTransport,
        fallback: bool,
    ) -> CacheCoordinator<Site> {
        let store = Arc::new(DistributedCache::<Site, _>::new(transport, policy(), "site:"));
        let local = fallback.then(|| Arc::new(LocalCache::new(100)));
        CacheCoordinator::distributed(store, local)
    }

    #[tokio::test]
    async fn test_set_then_get_counts_one_hit() {
        let coordinator = with_transport(FakeTransport::default(), true);
        coordinator
            .set("site:subdomain:acme", acme(), Duration::from_secs(300))
            .await
            .unwrap();

        let found = coordinator.get("site:subdomain:acme").await.unwrap().unwrap();
        assert_eq!(*found, Site::new("s1", "acme"));

        let metrics = coordinator.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 0);
        assert_eq!(metrics.operations, 2);
        assert_eq!(metrics.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_is_transparent() {
        let coordinator = with_transport(FakeTransport::offline(), true);

        coordinator
            .set("site:subdomain:acme", acme(), Duration::from_secs(300))
            .await
            .unwrap();
        let served = coordinator.get_served("site:subdomain:acme").await.unwrap();

        assert_eq!(served.value.unwrap().id, "s1");
        assert_eq!(served.provider, CacheProvider::Memory);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.errors, 2, "one error per failed distributed call");
        assert_eq!(metrics.hits, 1);

        let health = coordinator.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.distributed_reachable);
        assert!(health.local_available);
        assert_eq!(health.error.as_deref(), Some("unavailable"));
    }

    #[tokio::test]
    async fn test_operation_errors_fall_back_after_connect() {
        let transport = FakeTransport::default();
        let coordinator = with_transport(transport.clone(), true);
        coordinator
            .set("site:subdomain:acme", acme(), Duration::from_secs(300))
            .await
            .unwrap();

        transport.set_offline(true);
        coordinator
            .set("site:subdomain:other", acme(), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(coordinator.metrics().errors, 1);

        let found = coordinator.get("site:subdomain:other").await.unwrap();
        assert!(found.is_some(), "written to the local tier during the outage");
        assert_eq!(coordinator.metrics().errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_fallback_errors_propagate() {
        let coordinator = with_transport(FakeTransport::offline(), false);

        let err = coordinator.get("site:subdomain:acme").await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
        assert!(
            coordinator
                .set("site:subdomain:acme", acme(), Duration::from_secs(60))
                .await
                .is_err()
        );
        assert_eq!(coordinator.metrics().errors, 2);

        let health = coordinator.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.local_available);
    }

    #[tokio::test]
    async fn test_delete_clears_stale_fallback_entry() {
        let transport = FakeTransport::default();
        let coordinator = with_transport(transport.clone(), true);
        assert!(coordinator.get("site:subdomain:acme").await.unwrap().is_none());

        transport.set_offline(true);
        coordinator
            .set("site:subdomain:acme", acme(), Duration::from_secs(300))
            .await
            .unwrap();
        transport.set_offline(false);

        coordinator.delete("site:subdomain:acme").await.unwrap();
        transport.set_offline(true);
        assert!(coordinator.get("site:subdomain:acme").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fallback() {
        let transport = FakeTransport::default();
        let coordinator = with_transport(transport.clone(), true);
        transport.set_offline(true);

        coordinator
            .mset(&[("a".into(), acme()), ("b".into(), acme())], Duration::from_secs(60))
            .await
            .unwrap();
        let values = coordinator
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        assert_eq!(values.iter().filter(|v| v.is_some()).count(), 2);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.errors, 2);
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn test_healthy_when_reachable() {
        let coordinator = with_transport(FakeTransport::default(), true);
        let health = coordinator.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.distributed_reachable);
        assert!(health.latency_ms.is_some());

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["distributedReachable"], true);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_memory_only_from_config() {
        let coordinator = CacheCoordinator::<Site>::from_config(&CacheConfig::default()).unwrap();
        assert_eq!(coordinator.provider(), CacheProvider::Memory);

        coordinator.set("k", acme(), Duration::from_secs(10)).await.unwrap();
        assert!(coordinator.get("k").await.unwrap().is_some());

        let health = coordinator.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(!health.distributed_reachable);
    }

    #[tokio::test]
    async fn test_bad_url_is_fatal_only_without_fallback() {
        let mut config = CacheConfig {
            url: Some("memcached://cache.internal:11211".into()),
            ..CacheConfig::default()
        };

        let coordinator = CacheCoordinator::<Site>::from_config(&config).unwrap();
        assert_eq!(coordinator.health_check().await.status, HealthStatus::Degraded);

        config.fallback_to_memory = false;
        assert!(matches!(
            CacheCoordinator::<Site>::from_config(&config),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_selects_transport_from_scheme() {
        let config = CacheConfig {
            url: Some("https://cache-proxy.example.com".into()),
            token: Some("secret".into()),
            ..CacheConfig::default()
        };
        let coordinator = CacheCoordinator::<Site>::from_config(&config).unwrap();
        assert_eq!(coordinator.provider(), CacheProvider::Http);

        let config = CacheConfig {
            url: Some("redis://127.0.0.1:6379".into()),
            ..CacheConfig::default()
        };
        let coordinator = CacheCoordinator::<Site>::from_config(&config).unwrap();
        assert_eq!(coordinator.provider(), CacheProvider::Redis);
        assert!(coordinator.local_cache().is_some());
    }
}
