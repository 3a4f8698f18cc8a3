//! Scope-keyed lock manager
//!
//! A lock is a value stored under `lock:{operation_type}:{cashier_id}` whose
//! content is the holder token. Acquisition is an atomic set-if-absent with a
//! TTL; release is a compare-and-delete on the token, so a caller whose lock
//! already expired cannot release the next holder's lock.
//!
//! The manager also keeps a local table of the locks it granted. The table
//! drives [`LockManager::active_locks`] and the expiry sweep; the backing
//! store stays the source of truth for exclusion.

use crate::clock::{to_chrono, Clock};
use crate::metrics::Metrics;
use crate::operation::MANUAL_CASH_CLOSING;
use crate::store::BackingStore;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notification_bus::{Notification, NotificationSink};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_PREFIX: &str = "lock:";

/// Unit of mutual exclusion: cashier + operation type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    cashier_id: String,
    operation_type: String,
}

impl ScopeKey {
    /// Create scope key
    pub fn new(cashier_id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            cashier_id: cashier_id.into(),
            operation_type: operation_type.into(),
        }
    }

    /// Scope of a manual cash closing
    pub fn manual_closing(cashier_id: impl Into<String>) -> Self {
        Self::new(cashier_id, MANUAL_CASH_CLOSING)
    }

    /// Parse a rendered key
    pub fn parse(key: &str) -> Option<Self> {
        let (operation_type, cashier_id) = key.strip_prefix(LOCK_PREFIX)?.split_once(':')?;
        Some(Self::new(cashier_id, operation_type))
    }

    /// Cashier
    pub fn cashier_id(&self) -> &str {
        &self.cashier_id
    }

    /// Operation type
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}", LOCK_PREFIX, self.operation_type, self.cashier_id)
    }
}

/// Fresh holder token for an operation
pub fn holder_token(operation_id: Uuid) -> String {
    format!("{}:{}", operation_id, Uuid::new_v4())
}

/// Granted lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Scope
    pub scope_key: ScopeKey,

    /// Token proving ownership
    pub holder_token: String,

    /// Grant time
    pub acquired_at: DateTime<Utc>,

    /// Time-to-live
    pub ttl: Duration,

    /// Granted while the manager was running on its fallback store
    pub degraded: bool,
}

impl Lock {
    /// Expiry time
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + to_chrono(self.ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Whether the lock outlived its TTL at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Result of [`LockManager::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Lock granted
    Granted(Lock),
    /// A live lock exists for the scope
    Denied,
}

/// Result of [`LockManager::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Lock removed
    Released,
    /// No live lock held by this token
    Rejected,
}

/// Capability required for administrative overrides.
///
/// Authentication happens outside this crate; whoever constructs the value
/// asserts that `actor` is an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCaller {
    actor: String,
}

impl PrivilegedCaller {
    /// Assert that `actor` holds administrative rights
    pub fn assert_admin(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        info!(actor = %actor, "Privileged caller asserted");
        Self { actor }
    }

    /// Acting administrator
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

/// Lock manager
pub struct LockManager {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    metrics: Metrics,
    source: String,
    held: DashMap<String, Lock>,
    degraded: AtomicBool,
}

impl LockManager {
    /// Create lock manager over `store`
    pub fn new(
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        metrics: Metrics,
        source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            metrics,
            source: source.into(),
            held: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Try to take the lock for `scope`
    pub async fn acquire(&self, scope: &ScopeKey, holder_token: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let key = scope.to_string();
        let granted = self.store.acquire(&key, holder_token, ttl).await?;
        let degraded = self.refresh_degraded();

        if !granted {
            self.metrics.record_contention();
            debug!(scope_key = %key, "Lock denied, scope already held");
            self.emit("lock_contention", json!({ "scopeKey": key }));
            return Ok(AcquireOutcome::Denied);
        }

        let lock = Lock {
            scope_key: scope.clone(),
            holder_token: holder_token.to_string(),
            acquired_at: self.clock.now(),
            ttl,
            degraded,
        };
        self.held.insert(key.clone(), lock.clone());

        debug!(scope_key = %key, degraded, "Lock acquired");
        self.emit(
            "lock_acquired",
            json!({ "scopeKey": key, "ttlMs": ttl.as_millis() as u64, "degraded": degraded }),
        );
        Ok(AcquireOutcome::Granted(lock))
    }

    /// Acquire and wrap the lock in a guard that releases on drop
    pub async fn acquire_guard(
        self: &Arc<Self>,
        scope: &ScopeKey,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>> {
        match self.acquire(scope, holder_token, ttl).await? {
            AcquireOutcome::Granted(lock) => Ok(Some(LockGuard {
                manager: Arc::clone(self),
                lock,
                released: false,
            })),
            AcquireOutcome::Denied => Ok(None),
        }
    }

    /// Release the lock for `scope` if `holder_token` still owns it
    pub async fn release(&self, scope: &ScopeKey, holder_token: &str) -> Result<ReleaseOutcome> {
        let key = scope.to_string();
        let released = self.store.release(&key, holder_token).await?;
        self.refresh_degraded();

        if !released {
            warn!(scope_key = %key, "Lock release rejected, token does not own the scope");
            self.emit("lock_release_rejected", json!({ "scopeKey": key }));
            return Ok(ReleaseOutcome::Rejected);
        }

        self.held.remove_if(&key, |_, lock| lock.holder_token == holder_token);
        debug!(scope_key = %key, "Lock released");
        self.emit("lock_released", json!({ "scopeKey": key }));
        Ok(ReleaseOutcome::Released)
    }

    /// Remove locks for `cashier_id` without token verification.
    ///
    /// With `operation_type` unset every operation type of the cashier is
    /// released. Returns the number of live locks removed.
    pub async fn force_release(
        &self,
        caller: &PrivilegedCaller,
        cashier_id: &str,
        operation_type: Option<&str>,
    ) -> Result<usize> {
        let keys: Vec<String> = match operation_type {
            Some(op) => vec![ScopeKey::new(cashier_id, op).to_string()],
            None => self
                .store
                .keys_with_prefix(LOCK_PREFIX)
                .await?
                .into_iter()
                .filter(|key| {
                    ScopeKey::parse(key).map_or(false, |scope| scope.cashier_id() == cashier_id)
                })
                .collect(),
        };

        let mut released = 0;
        for key in &keys {
            if self.store.delete(key).await? {
                released += 1;
            }
            self.held.remove(key);
        }

        warn!(
            actor = caller.actor(),
            cashier_id,
            operation_type = operation_type.unwrap_or("*"),
            released,
            "Locks force-released"
        );
        self.emit(
            "lock_force_released",
            json!({
                "actor": caller.actor(),
                "cashierId": cashier_id,
                "operationType": operation_type,
                "released": released,
            }),
        );
        Ok(released)
    }

    /// Live locks granted by this manager
    pub fn active_locks(&self) -> Vec<Lock> {
        let now = self.clock.now();
        let mut locks: Vec<Lock> = self
            .held
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        locks.sort_by_key(|lock| lock.acquired_at);
        locks
    }

    /// Drop locks past their TTL and purge expired store entries.
    /// Returns the number of entries reclaimed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();

        let mut expired = Vec::new();
        self.held.retain(|key, lock| {
            if lock.is_expired(now) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });

        for key in &expired {
            info!(scope_key = %key, "Lock expired without release, reclaimed");
            self.emit("lock_expired", json!({ "scopeKey": key }));
        }

        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Purged expired store entries");
        }

        Ok(expired.len() + purged)
    }

    /// Whether locks are currently served by the fallback store
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    fn refresh_degraded(&self) -> bool {
        let degraded = self.store.is_degraded();
        let was = self.degraded.swap(degraded, Ordering::SeqCst);

        if degraded != was {
            self.metrics.set_degraded(degraded);
            let event = if degraded { "lock_degraded" } else { "lock_recovered" };
            self.emit(event, json!({ "store": self.store.name() }));
        }
        degraded
    }

    fn emit(&self, event: &str, data: serde_json::Value) {
        self.sink
            .notify(Notification::at(self.source.as_str(), event, data, self.clock.now()));
    }
}

/// Lock that is released when dropped.
///
/// Prefer [`LockGuard::release`], which reports the outcome. A guard dropped
/// without an explicit release (error path, cancelled task) spawns the
/// release on the current runtime; outside a runtime the lock is left to
/// expire through its TTL.
pub struct LockGuard {
    manager: Arc<LockManager>,
    lock: Lock,
    released: bool,
}

impl LockGuard {
    /// The held lock
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Release now
    pub async fn release(mut self) -> Result<ReleaseOutcome> {
        self.released = true;
        self.manager
            .release(&self.lock.scope_key, &self.lock.holder_token)
            .await
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let manager = Arc::clone(&self.manager);
        let scope = self.lock.scope_key.clone();
        let token = self.lock.holder_token.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&scope, &token).await {
                        warn!(scope_key = %scope, "Deferred lock release failed: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(scope_key = %scope, "No runtime to release dropped lock, leaving it to TTL expiry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use notification_bus::CapturingSink;

    struct Fixture {
        manager: Arc<LockManager>,
        clock: ManualClock,
        sink: CapturingSink,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let sink = CapturingSink::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let manager = Arc::new(LockManager::new(
            store,
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
            Metrics::new().unwrap(),
            "lock-manager",
        ));
        Fixture { manager, clock, sink }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_scope_key_format() {
        let scope = ScopeKey::manual_closing("C1");
        assert_eq!(scope.to_string(), "lock:manual_cash_closing:C1");
        assert_eq!(ScopeKey::parse("lock:manual_cash_closing:C1"), Some(scope));
        assert_eq!(ScopeKey::parse("fingerprint:abc"), None);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let f = fixture();
        let scope = ScopeKey::manual_closing("C1");

        assert!(matches!(f.manager.acquire(&scope, "a", TTL).await.unwrap(), AcquireOutcome::Granted(_)));
        assert_eq!(f.manager.acquire(&scope, "b", TTL).await.unwrap(), AcquireOutcome::Denied);

        // Other cashiers are independent
        let other = ScopeKey::manual_closing("C2");
        assert!(matches!(f.manager.acquire(&other, "c", TTL).await.unwrap(), AcquireOutcome::Granted(_)));

        assert_eq!(f.sink.count("lock_acquired"), 2);
        assert_eq!(f.sink.count("lock_contention"), 1);
    }

    #[tokio::test]
    async fn test_foreign_token_cannot_release() {
        let f = fixture();
        let scope = ScopeKey::manual_closing("C1");
        f.manager.acquire(&scope, "owner", TTL).await.unwrap();

        assert_eq!(f.manager.release(&scope, "intruder").await.unwrap(), ReleaseOutcome::Rejected);
        assert_eq!(f.manager.active_locks().len(), 1);

        assert_eq!(f.manager.release(&scope, "owner").await.unwrap(), ReleaseOutcome::Released);
        assert!(f.manager.active_locks().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let f = fixture();
        let scope = ScopeKey::manual_closing("C1");
        f.manager.acquire(&scope, "crashed", TTL).await.unwrap();

        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.manager.sweep_expired().await.unwrap(), 2);
        assert_eq!(f.sink.count("lock_expired"), 1);

        assert!(matches!(f.manager.acquire(&scope, "next", TTL).await.unwrap(), AcquireOutcome::Granted(_)));
        // The stale holder must not release the new lock
        assert_eq!(f.manager.release(&scope, "crashed").await.unwrap(), ReleaseOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_force_release_all_operation_types() {
        let f = fixture();
        f.manager.acquire(&ScopeKey::manual_closing("C1"), "a", TTL).await.unwrap();
        f.manager.acquire(&ScopeKey::new("C1", "shift_handover"), "b", TTL).await.unwrap();
        f.manager.acquire(&ScopeKey::manual_closing("C2"), "c", TTL).await.unwrap();

        let admin = PrivilegedCaller::assert_admin("ops");
        assert_eq!(f.manager.force_release(&admin, "C1", None).await.unwrap(), 2);
        assert_eq!(f.manager.active_locks().len(), 1);

        assert_eq!(
            f.manager.force_release(&admin, "C2", Some(MANUAL_CASH_CLOSING)).await.unwrap(),
            1
        );
        assert_eq!(f.sink.count("lock_force_released"), 2);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let f = fixture();
        let scope = ScopeKey::manual_closing("C1");

        let guard = f.manager.acquire_guard(&scope, "a", TTL).await.unwrap().unwrap();
        assert!(f.manager.acquire_guard(&scope, "b", TTL).await.unwrap().is_none());
        drop(guard);

        // Let the spawned release run
        tokio::task::yield_now().await;
        assert!(f.manager.acquire_guard(&scope, "b", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_guard_explicit_release() {
        let f = fixture();
        let scope = ScopeKey::manual_closing("C1");

        let guard = f.manager.acquire_guard(&scope, "a", TTL).await.unwrap().unwrap();
        assert_eq!(guard.release().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(f.sink.count("lock_released"), 1);
    }
}
