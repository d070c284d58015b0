//! Redis-backed `IndexStore` on a multiplexed `ConnectionManager`.
//!
//! Every failure maps to `TransientIo`: the index is a projection, so the
//! caller's retry/reconcile machinery is the right recovery path.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::error::{ImagoError, Result};
use crate::index::store::IndexStore;

#[derive(Clone)]
pub struct RedisIndexStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisIndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisIndexStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn transient(op: &str, e: redis::RedisError) -> ImagoError {
    ImagoError::TransientIo(format!("redis {op} failed: {e}"))
}

impl RedisIndexStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("connecting to index cache at {url}");
        let client = redis::Client::open(url)
            .map_err(|e| ImagoError::Validation(format!("invalid cache url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ImagoError::TransientIo(format!("failed to connect to cache: {e}")))?;
        info!("index cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl IndexStore for RedisIndexStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(|e| transient("ZADD", e))
    }

    async fn zadd_multi(&self, entries: &[(String, String, f64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, member, score) in entries {
            pipe.zadd(key, member, *score).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| transient("ZADD pipeline", e))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member)
            .await
            .map_err(|e| transient("ZREM", e))
    }

    async fn zrem_multi(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, member) in entries {
            pipe.zrem(key, member).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| transient("ZREM pipeline", e))
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        conn.zrank(key, member)
            .await
            .map_err(|e| transient("ZRANK", e))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| transient("ZRANGE", e))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.zcard(key).await.map_err(|e| transient("ZCARD", e))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| transient("GET", e))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        conn.mget(keys).await.map_err(|e| transient("MGET", e))
    }

    async fn mset(&self, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.set_multiple::<_, _, ()>(pairs)
            .await
            .map_err(|e| transient("MSET", e))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| transient("SETEX", e))
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await.map_err(|e| transient("DEL", e))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(|e| transient("SCAN", e))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        debug!(pattern, count = keys.len(), "index key scan");
        Ok(keys)
    }
}
