//! Closing record persistence

use crate::store::BackingStore;
use crate::types::ClosingRecord;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Write-once storage for closing records
#[async_trait]
pub trait ClosingRepository: Send + Sync {
    /// Persist a new record; fails if the ID already exists
    async fn save(&self, record: &ClosingRecord) -> Result<()>;

    /// Record by ID
    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>>;

    /// All records of a cashier, oldest first
    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>>;
}

/// In-process repository
#[derive(Debug, Default)]
pub struct InMemoryClosingRepository {
    records: DashMap<Uuid, ClosingRecord>,
}

impl InMemoryClosingRepository {
    /// Create empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ClosingRepository for InMemoryClosingRepository {
    async fn save(&self, record: &ClosingRecord) -> Result<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(Error::Persistence(format!(
                "Closing record {} already exists",
                record.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>> {
        let mut records: Vec<ClosingRecord> = self
            .records
            .iter()
            .filter(|r| r.value().cashier_id == cashier_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

const RECORD_PREFIX: &str = "closing:record:";
const INDEX_PREFIX: &str = "closing:index:";

/// Repository on the shared backing store.
///
/// Records are JSON under `closing:record:{cashier_id}:{id}` with no TTL, and
/// `closing:index:{id}` points at the record key. `%` and `:` in cashier IDs
/// are percent-encoded so one cashier's prefix never matches another's.
pub struct StoreClosingRepository {
    store: Arc<dyn BackingStore>,
}

impl StoreClosingRepository {
    /// Create repository over `store`
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    fn cashier_prefix(cashier_id: &str) -> String {
        let segment = cashier_id.replace('%', "%25").replace(':', "%3A");
        format!("{}{}:", RECORD_PREFIX, segment)
    }

    fn key(cashier_id: &str, id: Uuid) -> String {
        format!("{}{}", Self::cashier_prefix(cashier_id), id)
    }

    fn index_key(id: Uuid) -> String {
        format!("{}{}", INDEX_PREFIX, id)
    }
}

#[async_trait]
impl ClosingRepository for StoreClosingRepository {
    async fn save(&self, record: &ClosingRecord) -> Result<()> {
        let key = Self::key(&record.cashier_id, record.id);
        let index_key = Self::index_key(record.id);
        let value = serde_json::to_string(record)?;

        if self.store.exists(&index_key).await? || self.store.exists(&key).await? {
            return Err(Error::Persistence(format!("Closing record {} already exists", record.id)));
        }
        self.store
            .set(&key, &value, None)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to persist {}: {}", key, e)))?;
        self.store
            .set(&index_key, &key, None)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to index {}: {}", key, e)))?;

        debug!(record_id = %record.id, cashier_id = %record.cashier_id, "Closing record persisted");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>> {
        let Some(key) = self.store.get(&Self::index_key(id)).await? else {
            return Ok(None);
        };
        match self.store.get(&key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>> {
        let prefix = Self::cashier_prefix(cashier_id);
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(&prefix).await? {
            if let Some(value) = self.store.get(&key).await? {
                records.push(serde_json::from_str::<ClosingRecord>(&value)?);
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}
