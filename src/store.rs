//! The storage contract shared by both cache tiers

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Which tier served an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheProvider {
    /// In-process map
    Memory,
    /// Native Redis protocol
    Redis,
    /// Redis commands over an HTTP proxy
    Http,
}

impl CacheProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheProvider::Memory => "memory",
            CacheProvider::Redis => "redis",
            CacheProvider::Http => "http",
        }
    }
}

impl fmt::Display for CacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform key/value contract over both tiers.
///
/// Keys arrive fully formed (see [`crate::DomainResolver`]); stores never
/// build or rewrite them.
#[async_trait]
pub trait CacheStore<V: Cacheable>: Send + Sync {
    /// Tier identity reported in response headers and health output
    fn provider(&self) -> CacheProvider;

    async fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError>;

    async fn set(&self, key: &str, value: Arc<V>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every entry this store owns
    async fn clear(&self) -> Result<(), CacheError>;

    /// Batch get; the result has one slot per key, in order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Arc<V>>>, CacheError>;

    /// Batch set with a shared TTL
    async fn mset(&self, entries: &[(String, Arc<V>)], ttl: Duration) -> Result<(), CacheError>;

    /// Round-trip latency probe
    async fn ping(&self) -> Result<Duration, CacheError>;
}
