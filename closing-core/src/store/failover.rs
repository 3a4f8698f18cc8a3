//! Primary store with an in-process fallback
//!
//! Every call goes to the primary first. An infrastructure error switches the
//! call to the fallback [`MemoryStore`] and flags the store as degraded; the
//! flag clears on the next successful primary call.
//!
//! Degraded mode only guarantees mutual exclusion inside this process. Two
//! service instances that both lose the primary will each grant the same lock
//! from their own fallback.

use super::{BackingStore, MemoryStore};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Primary store guarded by an in-process fallback
pub struct FailoverStore {
    primary: Arc<dyn BackingStore>,
    fallback: Arc<MemoryStore>,
    degraded: AtomicBool,
}

impl FailoverStore {
    /// Wrap `primary` with `fallback`
    pub fn new(primary: Arc<dyn BackingStore>, fallback: Arc<MemoryStore>) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// The fallback store
    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    /// Start out degraded, e.g. when the primary was unreachable at startup.
    /// Cleared by the first successful primary call.
    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    fn primary_ok(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(primary = self.primary.name(), "Primary backing store recovered");
        }
    }

    fn primary_failed(&self, op: &str, err: &crate::Error) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                primary = self.primary.name(),
                op,
                "Primary backing store unavailable, falling back to in-process store \
                 (mutual exclusion limited to this instance): {}",
                err
            );
        }
    }
}

#[async_trait]
impl BackingStore for FailoverStore {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        // A lock granted during an outage stays authoritative after recovery
        if self.fallback.exists(key).await? {
            return Ok(false);
        }

        match self.primary.acquire(key, token, ttl).await {
            Ok(granted) => {
                self.primary_ok();
                Ok(granted)
            }
            Err(e) => {
                self.primary_failed("acquire", &e);
                self.fallback.acquire(key, token, ttl).await
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        if self.fallback.release(key, token).await? {
            return Ok(true);
        }

        match self.primary.release(key, token).await {
            Ok(released) => {
                self.primary_ok();
                Ok(released)
            }
            Err(e) => {
                self.primary_failed("release", &e);
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.fallback.get(key).await? {
            return Ok(Some(value));
        }

        match self.primary.get(key).await {
            Ok(value) => {
                self.primary_ok();
                Ok(value)
            }
            Err(e) => {
                self.primary_failed("get", &e);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match self.primary.set(key, value, ttl).await {
            Ok(()) => {
                self.primary_ok();
                Ok(())
            }
            Err(e) => {
                self.primary_failed("set", &e);
                self.fallback.set(key, value, ttl).await
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.fallback.exists(key).await? {
            return Ok(true);
        }

        match self.primary.exists(key).await {
            Ok(found) => {
                self.primary_ok();
                Ok(found)
            }
            Err(e) => {
                self.primary_failed("exists", &e);
                Ok(false)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let in_fallback = self.fallback.delete(key).await?;

        match self.primary.delete(key).await {
            Ok(in_primary) => {
                self.primary_ok();
                Ok(in_fallback || in_primary)
            }
            Err(e) => {
                self.primary_failed("delete", &e);
                Ok(in_fallback)
            }
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> =
            self.fallback.keys_with_prefix(prefix).await?.into_iter().collect();

        match self.primary.keys_with_prefix(prefix).await {
            Ok(primary_keys) => {
                self.primary_ok();
                keys.extend(primary_keys);
            }
            Err(e) => self.primary_failed("keys_with_prefix", &e),
        }

        Ok(keys.into_iter().collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let purged = self.fallback.purge_expired().await?;
        Ok(purged + self.primary.purge_expired().await.unwrap_or(0))
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
