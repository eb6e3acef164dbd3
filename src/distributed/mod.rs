//! Network-backed cache tier
//!
//! [`DistributedCache`] owns the connection lifecycle and value encoding;
//! a [`Transport`] only knows how to move bytes. Two transports exist:
//! the native Redis protocol and a Redis-over-HTTP proxy for runtimes that
//! cannot open raw TCP sockets. Which one is used is decided from the
//! configured URL at startup.
//!
//! Connection handling:
//! - established lazily on the first operation
//! - connect attempts back off exponentially (capped) up to `max_retries`
//! - after the last failed attempt the tier is marked down and every call
//!   fails fast until `down_cooldown` has passed
//! - an operation failing with a connection-class error drops the
//!   connection so the next call reconnects
//! - connecting and the call itself share one `operation_timeout` deadline;
//!   a connect cycle that outlives it marks the tier down as well

mod native;
mod proxy;

pub use native::RedisTransport;
pub use proxy::HttpTransport;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::store::{CacheProvider, CacheStore, Cacheable};
use crate::{CacheConfig, CacheError};

/// Byte-level access to a remote key/value store with TTL support
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A live, cheaply clonable connection handle
    type Connection: Clone + Send + Sync + 'static;

    fn provider(&self) -> CacheProvider;

    async fn connect(&self) -> Result<Self::Connection, CacheError>;

    async fn get(&self, conn: &Self::Connection, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(
        &self,
        conn: &Self::Connection,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), CacheError>;

    async fn del(&self, conn: &Self::Connection, keys: &[String]) -> Result<(), CacheError>;

    async fn mget(
        &self,
        conn: &Self::Connection,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    async fn mset_ex(
        &self,
        conn: &Self::Connection,
        entries: Vec<(String, Vec<u8>)>,
        ttl_secs: u64,
    ) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`; returns the number deleted
    async fn clear_prefix(&self, conn: &Self::Connection, prefix: &str) -> Result<u64, CacheError>;

    async fn ping(&self, conn: &Self::Connection) -> Result<(), CacheError>;
}

/// Connection lifecycle and retry policy for a [`DistributedCache`]
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub down_cooldown: Duration,
    pub operation_timeout: Duration,
}

impl From<&CacheConfig> for ConnectionPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
            down_cooldown: config.down_cooldown,
            operation_timeout: config.operation_timeout,
        }
    }
}

enum ConnState<C> {
    Idle,
    Connected(C),
    Down { until: Instant },
}

/// Remote cache tier over any [`Transport`]
pub struct DistributedCache<V, T: Transport, C: Codec = JsonCodec> {
    transport: T,
    codec: C,
    policy: ConnectionPolicy,
    key_prefix: String,
    state: parking_lot::Mutex<ConnState<T::Connection>>,
    /// Serializes connect cycles; holders of `state` never await
    connecting: tokio::sync::Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

impl<V: Cacheable, T: Transport> DistributedCache<V, T, JsonCodec> {
    pub fn new(transport: T, policy: ConnectionPolicy, key_prefix: impl Into<String>) -> Self {
        Self::with_codec(transport, JsonCodec, policy, key_prefix)
    }
}

impl<V: Cacheable, T: Transport, C: Codec> DistributedCache<V, T, C> {
    pub fn with_codec(
        transport: T,
        codec: C,
        policy: ConnectionPolicy,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            codec,
            policy,
            key_prefix: key_prefix.into(),
            state: parking_lot::Mutex::new(ConnState::Idle),
            connecting: tokio::sync::Mutex::new(()),
            _value: PhantomData,
        }
    }

    /// Whether the tier is currently marked down
    pub fn is_down(&self) -> bool {
        matches!(&*self.state.lock(), ConnState::Down { until } if Instant::now() < *until)
    }

    /// Returns the live connection if there is one, or fails fast while down.
    fn current(&self) -> Option<Result<T::Connection, CacheError>> {
        match &*self.state.lock() {
            ConnState::Connected(conn) => Some(Ok(conn.clone())),
            ConnState::Down { until } if Instant::now() < *until => Some(Err(
                CacheError::Unavailable("marked down after repeated connection failures".into()),
            )),
            _ => None,
        }
    }

    async fn connection(&self) -> Result<T::Connection, CacheError> {
        if let Some(result) = self.current() {
            return result;
        }

        let _guard = self.connecting.lock().await;
        // Another task may have finished a connect cycle while we waited.
        if let Some(result) = self.current() {
            return result;
        }

        let provider = self.transport.provider();
        let attempts = self.policy.max_retries.max(1);
        let mut delay = self.policy.retry_delay;
        for attempt in 1..=attempts {
            match timeout(self.policy.operation_timeout, self.transport.connect()).await {
                Ok(Ok(conn)) => {
                    info!("Connected to {} cache (attempt {})", provider, attempt);
                    *self.state.lock() = ConnState::Connected(conn.clone());
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} cache connect attempt {}/{} failed: {}",
                        provider, attempt, attempts, e
                    );
                }
                Err(_) => {
                    warn!(
                        "{} cache connect attempt {}/{} timed out after {:?}",
                        provider, attempt, attempts, self.policy.operation_timeout
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(self.policy.max_retry_delay);
            }
        }

        error!(
            "{} cache unreachable after {} attempts; failing fast for {:?}",
            provider, attempts, self.policy.down_cooldown
        );
        self.mark_down();
        Err(CacheError::Unavailable(format!(
            "no connection after {} attempts",
            attempts
        )))
    }

    /// Mark the tier down unless another task has connected meanwhile.
    fn mark_down(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, ConnState::Connected(_)) {
            *state = ConnState::Down {
                until: Instant::now() + self.policy.down_cooldown,
            };
        }
    }

    /// Run one transport call, connecting first if needed, under a single
    /// operation deadline.
    async fn run<R, F, Fut>(&self, op: &'static str, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(T::Connection) -> Fut + Send,
        Fut: Future<Output = Result<R, CacheError>> + Send,
    {
        let deadline = Instant::now() + self.policy.operation_timeout;
        let conn = match timeout_at(deadline, self.connection()).await {
            Ok(conn) => conn?,
            Err(_) => {
                warn!(
                    "{} cache {} gave up connecting after {:?}; failing fast for {:?}",
                    self.transport.provider(),
                    op,
                    self.policy.operation_timeout,
                    self.policy.down_cooldown
                );
                self.mark_down();
                return Err(CacheError::Timeout(self.policy.operation_timeout));
            }
        };
        let result = match timeout_at(deadline, f(conn)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.policy.operation_timeout)),
        };

        if let Err(e) = &result
            && e.is_connection_error()
        {
            debug!(
                "{} cache {} failed with a connection error; dropping connection",
                self.transport.provider(),
                op
            );
            let mut state = self.state.lock();
            if matches!(*state, ConnState::Connected(_)) {
                *state = ConnState::Idle;
            }
        }
        result
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // SET EX takes whole seconds and rejects 0.
        ttl.as_secs().max(1)
    }

    async fn delete_corrupt(&self, key: &str) {
        let keys = [key.to_owned()];
        if let Err(e) = self
            .run("del", |conn| async move { self.transport.del(&conn, &keys).await })
            .await
        {
            warn!("Failed to delete corrupt cache entry {}: {}", key, e);
        }
    }
}

#[async_trait]
impl<V: Cacheable, T: Transport, C: Codec> CacheStore<V> for DistributedCache<V, T, C> {
    fn provider(&self) -> CacheProvider {
        self.transport.provider()
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        let bytes = self
            .run("get", |conn| async move { self.transport.get(&conn, key).await })
            .await?;

        match bytes {
            None => Ok(None),
            Some(bytes) => match self.codec.decode::<V>(&bytes) {
                Ok(value) => Ok(Some(Arc::new(value))),
                Err(e) => {
                    warn!(
                        "Failed to decode cached value for key {}: {}. Deleting corrupt entry.",
                        key, e
                    );
                    self.delete_corrupt(key).await;
                    Err(e)
                }
            },
        }
    }

    async fn set(&self, key: &str, value: Arc<V>, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return CacheStore::<V>::delete(self, key).await;
        }
        let bytes = self.codec.encode(value.as_ref())?;
        let ttl_secs = Self::ttl_secs(ttl);
        self.run("set", |conn| async move {
            self.transport.set_ex(&conn, key, bytes, ttl_secs).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let keys = [key.to_owned()];
        self.run("del", |conn| async move { self.transport.del(&conn, &keys).await })
            .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let prefix = self.key_prefix.as_str();
        let removed = self
            .run("clear", |conn| async move {
                self.transport.clear_prefix(&conn, prefix).await
            })
            .await?;
        info!(
            "Cleared {} keys with prefix {:?} from {} cache",
            removed,
            prefix,
            self.transport.provider()
        );
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Arc<V>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self
            .run("mget", |conn| async move { self.transport.mget(&conn, keys).await })
            .await?;

        let mut values = Vec::with_capacity(raw.len());
        for (key, bytes) in keys.iter().zip(raw) {
            match bytes {
                None => values.push(None),
                Some(bytes) => match self.codec.decode::<V>(&bytes) {
                    Ok(value) => values.push(Some(Arc::new(value))),
                    Err(e) => {
                        warn!("Failed to decode cached value for key {} in batch: {}", key, e);
                        self.delete_corrupt(key).await;
                        return Err(e);
                    }
                },
            }
        }
        Ok(values)
    }

    async fn mset(&self, entries: &[(String, Arc<V>)], ttl: Duration) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.codec.encode(value.as_ref())?)))
            .collect::<Result<Vec<_>, CacheError>>()?;
        let ttl_secs = Self::ttl_secs(ttl);
        self.run("mset", |conn| async move {
            self.transport.mset_ex(&conn, encoded, ttl_secs).await
        })
        .await
    }

    async fn ping(&self) -> Result<Duration, CacheError> {
        let started = Instant::now();
        self.run("ping", |conn| async move { self.transport.ping(&conn).await })
            .await?;
        Ok(started.elapsed())
    }
}

/// In-memory transports for exercising lifecycle and failover logic
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// A transport backed by a `HashMap` that can be switched offline.
    #[derive(Clone, Default)]
    pub struct FakeTransport {
        pub data: Arc<parking_lot::Mutex<HashMap<String, Vec<u8>>>>,
        pub offline: Arc<AtomicBool>,
        /// `connect` never resolves while set
        pub hang_connect: Arc<AtomicBool>,
        pub connects: Arc<AtomicU32>,
        pub calls: Arc<AtomicU32>,
    }

    impl FakeTransport {
        pub fn offline() -> Self {
            let transport = Self::default();
            transport.set_offline(true);
            transport
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                Err(CacheError::Remote("simulated outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Connection = ();

        fn provider(&self) -> CacheProvider {
            CacheProvider::Redis
        }

        async fn connect(&self) -> Result<(), CacheError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang_connect.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(CacheError::Remote("connection refused".into()));
            }
            Ok(())
        }

        async fn get(&self, _conn: &(), key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.check()?;
            Ok(self.data.lock().get(key).cloned())
        }

        async fn set_ex(
            &self,
            _conn: &(),
            key: &str,
            value: Vec<u8>,
            _ttl_secs: u64,
        ) -> Result<(), CacheError> {
            self.check()?;
            self.data.lock().insert(key.to_owned(), value);
            Ok(())
        }

        async fn del(&self, _conn: &(), keys: &[String]) -> Result<(), CacheError> {
            self.check()?;
            let mut data = self.data.lock();
            for key in keys {
                data.remove(key);
            }
            Ok(())
        }

        async fn mget(&self, _conn: &(), keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
            self.check()?;
            let data = self.data.lock();
            Ok(keys.iter().map(|key| data.get(key).cloned()).collect())
        }

        async fn mset_ex(
            &self,
            _conn: &(),
            entries: Vec<(String, Vec<u8>)>,
            _ttl_secs: u64,
        ) -> Result<(), CacheError> {
            self.check()?;
            self.data.lock().extend(entries);
            Ok(())
        }

        async fn clear_prefix(&self, _conn: &(), prefix: &str) -> Result<u64, CacheError> {
            self.check()?;
            let mut data = self.data.lock();
            let before = data.len();
            data.retain(|key, _| !key.starts_with(prefix));
            Ok((before - data.len()) as u64)
        }

        async fn ping(&self, _conn: &()) -> Result<(), CacheError> {
            self.check()
        }
    }

    pub fn policy() -> ConnectionPolicy {
        ConnectionPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
            down_cooldown: Duration::from_secs(30),
            operation_timeout: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeTransport, policy};
    use super::*;
    use crate::Site;
    use std::sync::atomic::Ordering;

    fn cache(transport: FakeTransport) -> DistributedCache<Site, FakeTransport> {
        DistributedCache::new(transport, policy(), "site:")
    }

    #[tokio::test]
    async fn test_round_trip_through_codec() {
        let transport = FakeTransport::default();
        let cache = cache(transport.clone());

        cache
            .set("site:subdomain:acme", Arc::new(Site::new("s1", "acme")), Duration::from_secs(300))
            .await
            .unwrap();
        let found = cache.get("site:subdomain:acme").await.unwrap().unwrap();
        assert_eq!(found.id, "s1");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1, "connected lazily once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_marks_down_after_retries_then_fails_fast() {
        let transport = FakeTransport::offline();
        let cache = cache(transport.clone());

        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        assert!(cache.is_down());

        // Fails fast without another connect cycle.
        assert!(cache.get("k").await.is_err());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        // After the cooldown a fresh cycle is attempted and succeeds.
        transport.set_offline(false);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_is_bounded_by_operation_timeout() {
        let transport = FakeTransport::default();
        transport.hang_connect.store(true, Ordering::SeqCst);
        let cache = Arc::new(cache(transport.clone()));
        let started = Instant::now();

        let concurrent = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k").await })
        };
        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        assert!(concurrent.await.unwrap().is_err());
        assert!(started.elapsed() <= policy().operation_timeout);

        // The stalled cycle marked the tier down; later calls fail fast.
        let before = started.elapsed();
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable(_))));
        assert_eq!(started.elapsed(), before);
        assert!(cache.is_down());
    }

    #[tokio::test]
    async fn test_corrupt_value_is_deleted_and_reported() {
        let transport = FakeTransport::default();
        transport
            .data
            .lock()
            .insert("site:subdomain:bad".into(), b"{not json".to_vec());
        let cache = cache(transport.clone());

        let err = cache.get("site:subdomain:bad").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(transport.data.lock().get("site:subdomain:bad").is_none());
    }

    #[tokio::test]
    async fn test_clear_only_touches_prefix() {
        let transport = FakeTransport::default();
        transport.data.lock().insert("other:key".into(), b"1".to_vec());
        let cache = cache(transport.clone());
        cache
            .set("site:subdomain:a", Arc::new(Site::new("1", "a")), Duration::from_secs(60))
            .await
            .unwrap();

        CacheStore::<Site>::clear(&cache).await.unwrap();
        let data = transport.data.lock();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("other:key"));
    }

    #[tokio::test]
    async fn test_batch_ops_preserve_order() {
        let cache = cache(FakeTransport::default());
        cache
            .mset(
                &[
                    ("a".into(), Arc::new(Site::new("1", "a"))),
                    ("b".into(), Arc::new(Site::new("2", "b"))),
                ],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let values = cache
            .mget(&["b".into(), "x".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(values[0].as_ref().unwrap().id, "2");
        assert!(values[1].is_none());
        assert_eq!(values[2].as_ref().unwrap().id, "1");
    }
}
