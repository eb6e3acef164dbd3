//! Native Redis protocol transport

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::Transport;
use crate::CacheError;
use crate::store::CacheProvider;

/// Keys deleted per DEL when clearing a prefix
const DELETE_CHUNK: usize = 500;

/// Talks RESP to a Redis server through a shared [`ConnectionManager`]
pub struct RedisTransport {
    client: redis::Client,
}

impl RedisTransport {
    /// Parse the URL. No connection is opened until first use.
    pub fn open(url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    type Connection = ConnectionManager;

    fn provider(&self) -> CacheProvider {
        CacheProvider::Redis
    }

    async fn connect(&self) -> Result<ConnectionManager, CacheError> {
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(conn)
    }

    async fn get(&self, conn: &ConnectionManager, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set_ex(
        &self,
        conn: &ConnectionManager,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let mut conn = conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, conn: &ConnectionManager, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn mget(
        &self,
        conn: &ConnectionManager,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut conn = conn.clone();
        // Explicit MGET: the typed helper switches to GET for a single key.
        Ok(redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<Vec<u8>>>>(&mut conn)
            .await?)
    }

    async fn mset_ex(
        &self,
        conn: &ConnectionManager,
        entries: Vec<(String, Vec<u8>)>,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set_ex(key, value, ttl_secs).ignore();
        }
        let mut conn = conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn clear_prefix(&self, conn: &ConnectionManager, prefix: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}*", prefix);
        let mut conn = conn.clone();
        let keys: Vec<String> = {
            let iter = conn.scan_match::<_, String>(&pattern).await?;
            iter.collect().await
        };

        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK) {
            removed += conn.del::<_, u64>(chunk).await?;
        }
        Ok(removed)
    }

    async fn ping(&self, conn: &ConnectionManager) -> Result<(), CacheError> {
        let mut conn = conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
