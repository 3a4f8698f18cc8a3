//! Pluggable key-value backing store
//!
//! The lock manager, the fingerprint validator and the store-backed closing
//! repository all talk to a [`BackingStore`]. It is constructed once and
//! passed in explicitly, so the same orchestration code runs against Redis in
//! production and against [`MemoryStore`] in tests.

mod failover;
mod memory;
mod redis_store;

pub use self::failover::FailoverStore;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Key-value capability with TTL and atomic ownership primitives
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Atomically store `token` under `key` if no live value exists.
    /// Returns `true` when stored.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `token`.
    /// Returns `true` when deleted.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Live value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Whether a live value exists under `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Unconditional delete; returns `true` if a live value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Drop expired entries; backends with native expiry return 0
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Whether the store is currently running on a degraded fallback
    fn is_degraded(&self) -> bool {
        false
    }
}
