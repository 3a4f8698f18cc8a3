//! Mutual exclusion, lock reclamation and degraded-mode tests

use async_trait::async_trait;
use closing_core::{
    BackingStore, CashData, ClosingEngine, ClosingRecord, ClosingRepository, Config, Error,
    ErrorCode, FailoverStore, InMemoryClosingRepository, ManualClock, MemoryStore,
    OperationStatus, PrivilegedCaller, Result, ScopeKey, SubmitRequest, MANUAL_CASH_CLOSING,
};
use notification_bus::CapturingSink;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Repository whose writes take a while, to hold the lock open
struct SlowRepository {
    inner: InMemoryClosingRepository,
    delay: Duration,
}

#[async_trait]
impl ClosingRepository for SlowRepository {
    async fn save(&self, record: &ClosingRecord) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>> {
        self.inner.get(id).await
    }

    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>> {
        self.inner.list_for_cashier(cashier_id).await
    }
}

/// Repository whose first write never finishes
#[derive(Default)]
struct StallFirstRepository {
    inner: InMemoryClosingRepository,
    stalled: AtomicBool,
}

#[async_trait]
impl ClosingRepository for StallFirstRepository {
    async fn save(&self, record: &ClosingRecord) -> Result<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.save(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>> {
        self.inner.get(id).await
    }

    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>> {
        self.inner.list_for_cashier(cashier_id).await
    }
}

/// Repository that tracks how many writes run at once
struct OverlapRepository {
    inner: InMemoryClosingRepository,
    delay: Duration,
    in_save: AtomicUsize,
    max_in_save: AtomicUsize,
}

struct SaveSlot<'a>(&'a AtomicUsize);

impl Drop for SaveSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClosingRepository for OverlapRepository {
    async fn save(&self, record: &ClosingRecord) -> Result<()> {
        let running = self.in_save.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_save.fetch_max(running, Ordering::SeqCst);
        let _slot = SaveSlot(&self.in_save);

        tokio::time::sleep(self.delay).await;
        self.inner.save(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ClosingRecord>> {
        self.inner.get(id).await
    }

    async fn list_for_cashier(&self, cashier_id: &str) -> Result<Vec<ClosingRecord>> {
        self.inner.list_for_cashier(cashier_id).await
    }
}

/// Distributed store that is always unreachable
struct UnreachableStore;

fn refused<T>() -> Result<T> {
    Err(Error::Store("connection refused".to_string()))
}

#[async_trait]
impl BackingStore for UnreachableStore {
    fn name(&self) -> &'static str {
        "unreachable"
    }
    async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
        refused()
    }
    async fn release(&self, _key: &str, _token: &str) -> Result<bool> {
        refused()
    }
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        refused()
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        refused()
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        refused()
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
        refused()
    }
    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        refused()
    }
}

fn slow_engine(clock: &ManualClock, delay: Duration) -> Arc<ClosingEngine> {
    let engine = ClosingEngine::builder(Config::default())
        .clock(Arc::new(clock.clone()))
        .store(Arc::new(MemoryStore::new(Arc::new(clock.clone()))))
        .repository(Arc::new(SlowRepository {
            inner: InMemoryClosingRepository::new(),
            delay,
        }))
        .build()
        .unwrap();
    Arc::new(engine)
}

fn payload(sales: f64) -> CashData {
    CashData::new(100.0, sales, 100.0 + sales)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_same_cashier() {
    let clock = ManualClock::default();
    let engine = slow_engine(&clock, Duration::from_millis(200));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit(SubmitRequest::new("C1", payload(50.0 + i as f64)))
                    .await
            })
        })
        .collect();

    let mut completed = 0;
    let mut in_progress = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        match outcome.error_code() {
            None => completed += 1,
            Some(ErrorCode::OperationInProgress) => in_progress += 1,
            Some(other) => panic!("unexpected outcome {}", other),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(in_progress, 9);
    assert_eq!(engine.metrics().lock_contention_total.get(), 9);
    assert!(engine.orchestrator().lock_manager().active_locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_distinct_cashiers() {
    let clock = ManualClock::default();
    let engine = slow_engine(&clock, Duration::from_millis(50));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit(SubmitRequest::new(format!("C{}", i), payload(10.0)))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_completed());
    }
    assert_eq!(engine.stats().completed, 8);
}

#[tokio::test]
async fn test_crashed_holder_reclaimed_after_ttl() {
    let clock = ManualClock::default();
    let engine = slow_engine(&clock, Duration::ZERO);
    let scheduler = engine.scheduler();
    let locks = engine.orchestrator().lock_manager().clone();

    // A holder that never releases
    locks
        .acquire(&ScopeKey::manual_closing("C1"), "crashed", Duration::from_secs(30))
        .await
        .unwrap();

    let blocked = engine.submit(SubmitRequest::new("C1", payload(1.0))).await;
    assert_eq!(blocked.error_code(), Some(ErrorCode::OperationInProgress));

    clock.advance(Duration::from_secs(31));
    assert!(scheduler.tick_all().await >= 1);
    assert!(locks.active_locks().is_empty());

    let retried = engine.submit(SubmitRequest::new("C1", payload(1.0))).await;
    assert_eq!(retried.status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_force_release_unblocks_cashier() {
    let clock = ManualClock::default();
    let engine = slow_engine(&clock, Duration::ZERO);
    let locks = engine.orchestrator().lock_manager().clone();

    locks
        .acquire(&ScopeKey::manual_closing("C1"), "stuck", Duration::from_secs(30))
        .await
        .unwrap();

    let admin = PrivilegedCaller::assert_admin("supervisor-7");
    let released = engine
        .force_release(&admin, "C1", Some(MANUAL_CASH_CLOSING))
        .await
        .unwrap();
    assert_eq!(released, 1);

    assert!(engine.submit(SubmitRequest::new("C1", payload(1.0))).await.is_completed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_submission_releases_lock() {
    let clock = ManualClock::default();
    let engine = slow_engine(&clock, Duration::from_secs(60));

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(SubmitRequest::new("C1", payload(1.0))).await })
    };

    // Wait until the submission is parked inside the repository write
    for _ in 0..100 {
        if !engine.orchestrator().lock_manager().active_locks().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.orchestrator().lock_manager().active_locks().len(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if engine.orchestrator().lock_manager().active_locks().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.orchestrator().lock_manager().active_locks().is_empty());

    // The abandoned operation stays visible until its grace period runs out
    assert_eq!(engine.list_active().len(), 1);
    clock.advance(Duration::from_secs(5 * 60));
    engine.scheduler().tick_all().await;
    assert!(engine.list_active().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_submission_can_be_retried() {
    let clock = ManualClock::default();
    let repository = Arc::new(StallFirstRepository::default());
    let engine = Arc::new(
        ClosingEngine::builder(Config::default())
            .clock(Arc::new(clock.clone()))
            .store(Arc::new(MemoryStore::new(Arc::new(clock.clone()))))
            .repository(repository.clone())
            .build()
            .unwrap(),
    );

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(SubmitRequest::new("C1", payload(1.0))).await })
    };

    while !repository.stalled.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if engine.orchestrator().lock_manager().active_locks().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.orchestrator().lock_manager().active_locks().is_empty());

    // Same payload, same minute: no record exists, so it is not a duplicate
    let retry = engine.submit(SubmitRequest::new("C1", payload(1.0))).await;
    assert_eq!(retry.status, OperationStatus::Completed);
    assert_eq!(repository.inner.len(), 1);

    let again = engine.submit(SubmitRequest::new("C1", payload(1.0))).await;
    assert_eq!(again.error_code(), Some(ErrorCode::DuplicateOperation));
    assert_eq!(repository.inner.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processing_never_outlives_lock() {
    let mut config = Config::default();
    config.lock.ttl_secs = 2;
    config.lock.sweep_interval_secs = 1;

    let repository = Arc::new(OverlapRepository {
        inner: InMemoryClosingRepository::new(),
        delay: Duration::from_secs(3),
        in_save: AtomicUsize::new(0),
        max_in_save: AtomicUsize::new(0),
    });
    // Real clock: the lock expires in wall time
    let engine = Arc::new(
        ClosingEngine::builder(config)
            .repository(repository.clone())
            .build()
            .unwrap(),
    );

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(SubmitRequest::new("C1", payload(1.0))).await })
    };
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(SubmitRequest::new("C1", payload(2.0))).await })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(first.error_code(), Some(ErrorCode::ProcessingError));
    assert_eq!(second.error_code(), Some(ErrorCode::ProcessingError));
    assert_eq!(repository.max_in_save.load(Ordering::SeqCst), 1);
    assert!(repository.inner.is_empty());
}

#[tokio::test]
async fn test_degraded_mode_keeps_exclusion_in_process() {
    let clock = ManualClock::default();
    let sink = CapturingSink::new();
    let store = Arc::new(FailoverStore::new(
        Arc::new(UnreachableStore),
        Arc::new(MemoryStore::new(Arc::new(clock.clone()))),
    ));

    let engine = ClosingEngine::builder(Config::default())
        .clock(Arc::new(clock.clone()))
        .store(store)
        .repository(Arc::new(InMemoryClosingRepository::new()))
        .sink(Arc::new(sink.clone()))
        .build()
        .unwrap();

    let first = engine.submit(SubmitRequest::new("C1", payload(5.0))).await;
    assert!(first.is_completed());
    assert!(engine.is_degraded());
    assert_eq!(engine.metrics().lock_degraded.get(), 1);
    assert_eq!(sink.count("lock_degraded"), 1);

    // Duplicate detection still works on the fallback
    let again = engine.submit(SubmitRequest::new("C1", payload(5.0))).await;
    assert_eq!(again.error_code(), Some(ErrorCode::DuplicateOperation));

    // And so does exclusion
    let locks = engine.orchestrator().lock_manager().clone();
    locks
        .acquire(&ScopeKey::manual_closing("C2"), "holder", Duration::from_secs(30))
        .await
        .unwrap();
    let blocked = engine.submit(SubmitRequest::new("C2", payload(5.0))).await;
    assert_eq!(blocked.error_code(), Some(ErrorCode::OperationInProgress));
}

#[tokio::test]
async fn test_lock_error_when_fallback_disabled() {
    let clock = ManualClock::default();
    let mut config = Config::default();
    config.lock.fallback_enabled = false;

    let engine = ClosingEngine::builder(config)
        .clock(Arc::new(clock))
        .store(Arc::new(UnreachableStore))
        .repository(Arc::new(InMemoryClosingRepository::new()))
        .build()
        .unwrap();

    let outcome = engine.submit(SubmitRequest::new("C1", payload(5.0))).await;
    assert_eq!(outcome.status, OperationStatus::Error);
    assert_eq!(outcome.error_code(), Some(ErrorCode::LockError));
    assert_eq!(engine.stats().errored, 1);
}
