//! Key-value/sorted-set port for the cross-collection index: exactly the
//! operations the index service issues, nothing more. The engine owns the
//! `idx:` prefix and never touches keys outside it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Pipelined batch of `(key, member, score)` additions.
    async fn zadd_multi(&self, entries: &[(String, String, f64)]) -> Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    async fn zrem_multi(&self, entries: &[(String, String)]) -> Result<()>;

    /// Ascending 0-based rank of `member`, if present.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>>;

    /// Ascending range by rank, inclusive bounds, Redis semantics.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// One round trip for many keys; order and arity match `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Batched write so a summary and its state become visible together.
    async fn mset(&self, pairs: &[(String, Vec<u8>)]) -> Result<()>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn del(&self, keys: &[String]) -> Result<()>;

    /// Glob-style key scan (`idx:state:*`).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
}
