//! In-process backing store
//!
//! Per-key atomicity comes from `DashMap` entry locking. Expiry is evaluated
//! lazily against the injected clock on every read, and eagerly by
//! [`MemoryStore::purge_expired_at`].

use super::BackingStore;
use crate::clock::{to_chrono, Clock};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store with the same semantics as the distributed one
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create empty store
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries expired at `now`
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
        ttl.map(|ttl| to_chrono(ttl).map(|ttl| now + ttl)).transpose()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let stored = StoredValue {
            value: token.to_string(),
            expires_at: self.expiry(now, Some(ttl))?,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(stored);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == token)
            .is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: self.expiry(now, ttl)?,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.entries.get(key).map_or(false, |v| v.is_live(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, v)| v.is_live(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self.purge_expired_at(self.clock.now()))
    }
}
