//! Cash Closing Core
//!
//! Guarantees that a cash-register closing runs at most once per cashier per
//! time window, even under concurrent or duplicate submissions.
//!
//! # Architecture
//!
//! A submission flows through:
//!
//! 1. **Lock manager**: scope-keyed mutual exclusion (`cashier + operation type`)
//!    with TTL expiry, on Redis or an in-process fallback
//! 2. **Fingerprint validator**: payload validation, then duplicate detection
//!    over a minute-bucketed digest
//! 3. **Reconciliation**: expected cash, variance, classification and
//!    recommendations in 2-decimal half-up arithmetic
//! 4. **Repository**: write-once closing record
//!
//! The [`Orchestrator`] drives each submission through the
//! `VALIDATING -> PROCESSING -> COMPLETED | ERROR` state machine and always
//! releases the lock it took. Expired locks, abandoned operations and old
//! history are reclaimed by a [`SweepScheduler`].
//!
//! # Example
//!
//! ```no_run
//! use closing_core::{CashData, ClosingEngine, Config, SubmitRequest};
//! use notification_bus::NoopSink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> closing_core::Result<()> {
//!     let engine = ClosingEngine::new(Config::default(), Arc::new(NoopSink)).await?;
//!
//!     let request = SubmitRequest::new("C1", CashData::new(1000.0, 500.0, 1500.0));
//!     let outcome = engine.submit(request).await;
//!     println!("{} -> {}", outcome.operation_id, outcome.status);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod metrics;
pub mod operation;
pub mod orchestrator;
pub mod reconciliation;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{ClosingEngine, ClosingEngineBuilder};
pub use error::{Error, Result};
pub use fingerprint::{compute_fingerprint, validate_cash_data, FingerprintValidator};
pub use lock::{AcquireOutcome, Lock, LockGuard, LockManager, PrivilegedCaller, ReleaseOutcome, ScopeKey};
pub use metrics::Metrics;
pub use operation::{
    ActiveOperationView, ClosingResult, ErrorCode, HistoryEntry, HistoryPage, HistoryQuery,
    HistorySummary, OperationError, OperationStats, OperationStatus, PendingOperation,
    SubmitOutcome, SubmitRequest, MANUAL_CASH_CLOSING,
};
pub use orchestrator::Orchestrator;
pub use reconciliation::{CashBalance, Priority, Recommendation, RecommendationKind};
pub use repository::{ClosingRepository, InMemoryClosingRepository, StoreClosingRepository};
pub use scheduler::{PeriodicTask, SchedulerHandle, SweepScheduler};
pub use store::{BackingStore, FailoverStore, MemoryStore, RedisStore};
pub use types::{BalanceStatus, CashAmounts, CashData, ClosingRecord, Denomination, Violation};
