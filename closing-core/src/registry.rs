//! Active-operation registry and history log

use crate::operation::{
    ActiveOperationView, HistoryEntry, HistoryPage, HistoryQuery, OperationStatus, PendingOperation,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use uuid::Uuid;

/// Operations that have not yet left the registry
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    operations: DashMap<Uuid, PendingOperation>,
}

impl ActiveRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot of an operation
    pub fn upsert(&self, operation: &PendingOperation) {
        self.operations.insert(operation.operation_id, operation.clone());
    }

    /// Snapshot of one operation
    pub fn get(&self, id: Uuid) -> Option<PendingOperation> {
        self.operations.get(&id).map(|op| op.value().clone())
    }

    /// Remove an operation
    pub fn remove(&self, id: Uuid) -> Option<PendingOperation> {
        self.operations.remove(&id).map(|(_, op)| op)
    }

    /// Number of tracked operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Views ordered by start time
    pub fn list(&self, now: DateTime<Utc>) -> Vec<ActiveOperationView> {
        let mut views: Vec<ActiveOperationView> =
            self.operations.iter().map(|op| op.value().view(now)).collect();
        views.sort_by_key(|v| v.start_time);
        views
    }

    /// Remove every operation past its grace period
    pub fn evict(&self, now: DateTime<Utc>) -> Vec<PendingOperation> {
        let stale: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|op| op.value().is_evictable(now))
            .map(|op| *op.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.operations
                    .remove_if(&id, |_, op| op.is_evictable(now))
                    .map(|(_, op)| op)
            })
            .collect()
    }
}

/// Terminal operations within the retention window
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl HistoryLog {
    /// Create empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a terminal snapshot
    pub fn append(&self, entry: HistoryEntry) {
        self.entries.write().push_back(entry);
    }

    /// Entry for an operation
    pub fn get(&self, id: Uuid) -> Option<HistoryEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.operation_id() == id)
            .cloned()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Count entries with the given terminal status
    pub fn count_status(&self, status: OperationStatus) -> usize {
        self.entries.read().iter().filter(|e| e.status() == status).count()
    }

    /// Filtered page, newest first
    pub fn query(&self, query: &HistoryQuery, max_page_size: usize) -> HistoryPage {
        let limit = query
            .limit
            .unwrap_or(HistoryQuery::DEFAULT_LIMIT)
            .min(max_page_size);

        let entries = self.entries.read();
        let mut matching: Vec<&HistoryEntry> = entries
            .iter()
            .filter(|e| {
                query
                    .cashier_id
                    .as_deref()
                    .map_or(true, |cashier| e.cashier_id() == cashier)
            })
            .collect();
        matching.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        HistoryPage {
            total: matching.len(),
            entries: matching
                .into_iter()
                .skip(query.offset)
                .take(limit)
                .map(HistoryEntry::summary)
                .collect(),
        }
    }

    /// Drop entries completed before `cutoff`
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.completed_at >= cutoff);
        before - entries.len()
    }
}
