//! Operation orchestrator
//!
//! Drives one submission through `VALIDATING -> PROCESSING -> COMPLETED`, or
//! into `ERROR` from either non-terminal state:
//!
//! 1. Register the operation at `VALIDATING`
//! 2. Take the cashier's closing lock
//! 3. Validate the payload, then check its fingerprint for duplicates
//! 4. Record the fingerprint and move to `PROCESSING`
//! 5. Reconcile and persist the closing record, then `COMPLETED`
//!
//! Steps 3 to 5 run under a deadline just short of the lock TTL, so the lock
//! cannot expire while the operation is still processing. A fingerprint
//! recorded in step 4 is forgotten again unless the closing record was
//! persisted. The lock is released exactly once on every path that acquired
//! it, after the fingerprint was settled. If the submitting task is
//! cancelled, the in-flight guard does both on drop. Terminal operations
//! move from the active registry to the history log.

use crate::clock::{to_chrono, Clock};
use crate::config::Config;
use crate::fingerprint::{compute_fingerprint, validate_cash_data, FingerprintValidator};
use crate::lock::{holder_token, LockGuard, LockManager, PrivilegedCaller, ReleaseOutcome, ScopeKey};
use crate::metrics::Metrics;
use crate::operation::{
    ActiveOperationView, ClosingResult, ErrorCode, HistoryEntry, HistoryPage, HistoryQuery,
    OperationError, OperationStats, OperationStatus, PendingOperation, SubmitOutcome, SubmitRequest,
};
use crate::reconciliation;
use crate::registry::{ActiveRegistry, HistoryLog};
use crate::repository::ClosingRepository;
use crate::types::{CashAmounts, ClosingRecord, Violation};
use crate::{Error, Result};
use notification_bus::{Notification, NotificationSink};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type StepResult<T> = std::result::Result<T, OperationError>;

/// Operation orchestrator
pub struct Orchestrator {
    locks: Arc<LockManager>,
    fingerprints: FingerprintValidator,
    repository: Arc<dyn ClosingRepository>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    metrics: Metrics,
    active: ActiveRegistry,
    history: HistoryLog,
    lock_ttl: Duration,
    processing_deadline: Duration,
    grace_period: chrono::Duration,
    history_retention: chrono::Duration,
    max_page_size: usize,
    source: String,
}

impl Orchestrator {
    /// Create orchestrator
    pub fn new(
        config: &Config,
        locks: Arc<LockManager>,
        fingerprints: FingerprintValidator,
        repository: Arc<dyn ClosingRepository>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        metrics: Metrics,
    ) -> Result<Self> {
        Ok(Self {
            locks,
            fingerprints,
            repository,
            clock,
            sink,
            metrics,
            active: ActiveRegistry::new(),
            history: HistoryLog::new(),
            lock_ttl: config.lock_ttl(),
            processing_deadline: processing_deadline(config.lock_ttl()),
            grace_period: to_chrono(config.grace_period())?,
            history_retention: to_chrono(config.history_retention())?,
            max_page_size: config.operation.history_max_page_size,
            source: config.notification.source.clone(),
        })
    }

    /// Run a closing submission to a terminal state
    pub async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        let mut op = PendingOperation::new(&request, self.clock.now(), self.grace_period);
        let operation_id = op.operation_id;
        self.active.upsert(&op);
        self.metrics.set_active(self.active.len());

        info!(%operation_id, cashier_id = %op.cashier_id, "Closing submitted");
        self.emit(
            "operation_started",
            json!({ "operationId": operation_id, "cashierId": op.cashier_id }),
        );

        let scope = ScopeKey::manual_closing(&request.cashier_id);
        let token = holder_token(operation_id);

        let outcome = match self.locks.acquire_guard(&scope, &token, self.lock_ttl).await {
            Ok(Some(guard)) => {
                let mut in_flight = InFlight::new(guard, self.fingerprints.clone());
                let outcome = match tokio::time::timeout(
                    self.processing_deadline,
                    self.run_locked(&mut op, &request, &mut in_flight),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(OperationError::new(
                        ErrorCode::ProcessingError,
                        format!(
                            "Closing did not finish within {} ms; lock released before expiry",
                            self.processing_deadline.as_millis()
                        ),
                    )),
                };

                match in_flight.settle().await {
                    Ok(ReleaseOutcome::Released) => {}
                    Ok(ReleaseOutcome::Rejected) => {
                        warn!(%operation_id, scope_key = %scope, "Lock expired before release");
                    }
                    Err(e) => {
                        warn!(%operation_id, scope_key = %scope, "Lock release failed: {}", e);
                    }
                }
                outcome
            }
            Ok(None) => Err(OperationError::new(
                ErrorCode::OperationInProgress,
                format!("A closing is already in progress for cashier {}", request.cashier_id),
            )),
            Err(e) => {
                error!(%operation_id, scope_key = %scope, "Lock acquisition failed: {}", e);
                Err(OperationError::new(
                    ErrorCode::LockError,
                    "Could not confirm exclusive access; closing denied",
                ))
            }
        };

        self.finish(op, outcome)
    }

    /// Steps run while holding the lock
    async fn run_locked(
        &self,
        op: &mut PendingOperation,
        request: &SubmitRequest,
        in_flight: &mut InFlight,
    ) -> StepResult<ClosingResult> {
        let violations = validate_cash_data(&request.cash_data);
        if !violations.is_empty() {
            return Err(OperationError::invalid_input(violations));
        }

        let amounts = request.cash_data.amounts().ok_or_else(|| {
            OperationError::invalid_input(vec![Violation::new(
                "cashData",
                "amounts could not be normalized",
            )])
        })?;

        let fingerprint = compute_fingerprint(&op.cashier_id, &amounts, op.started_at);
        op.fingerprint = Some(fingerprint.clone());
        self.active.upsert(op);

        match self.fingerprints.check_duplicate(&fingerprint).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(OperationError::new(
                    ErrorCode::DuplicateOperation,
                    "An identical closing was accepted recently",
                ));
            }
            Err(e) => return Err(processing_error("Duplicate check failed", &e)),
        }

        // From here on the fingerprint is forgotten unless the record lands
        in_flight.reserve(&fingerprint);
        self.fingerprints
            .record(&fingerprint, &request.cash_data, self.clock.now())
            .await
            .map_err(|e| processing_error("Recording fingerprint failed", &e))?;

        self.advance(op, OperationStatus::Processing)?;

        let result = self
            .persist(op, &amounts, &fingerprint)
            .await
            .map_err(|e| processing_error("Closing failed", &e))?;
        in_flight.commit();
        Ok(result)
    }

    async fn persist(
        &self,
        op: &PendingOperation,
        amounts: &CashAmounts,
        fingerprint: &str,
    ) -> Result<ClosingResult> {
        let balance = reconciliation::reconcile(amounts);
        let recommendations = reconciliation::recommend(&balance);

        let record = ClosingRecord {
            id: Uuid::new_v4(),
            operation_id: op.operation_id,
            cashier_id: op.cashier_id.clone(),
            session_id: op.session_id.clone(),
            timestamp: self.clock.now(),
            initial_cash: amounts.initial_cash,
            sales_total: amounts.sales_total,
            reported_cash: amounts.reported_cash,
            expected_cash: balance.expected_cash,
            cash_difference: balance.cash_difference,
            percentage_difference: balance.percentage_difference,
            denominations: op.payload.denominations.clone(),
            status: balance.status(),
            fingerprint: fingerprint.to_string(),
            notes: op.notes.clone(),
        };
        self.repository.save(&record).await?;

        Ok(ClosingResult {
            record_id: record.id,
            expected_cash: balance.expected_cash,
            reported_cash: amounts.reported_cash,
            cash_difference: balance.cash_difference,
            percentage_difference: balance.percentage_difference,
            status: record.status,
            recommendations,
        })
    }

    fn advance(&self, op: &mut PendingOperation, next: OperationStatus) -> StepResult<()> {
        op.transition(next, self.clock.now())
            .map_err(|e| processing_error("State transition rejected", &e))?;
        self.active.upsert(op);
        debug!(operation_id = %op.operation_id, status = %next, "Operation advanced");
        Ok(())
    }

    fn finish(&self, mut op: PendingOperation, outcome: StepResult<ClosingResult>) -> SubmitOutcome {
        let now = self.clock.now();
        let operation_id = op.operation_id;

        let (next, label) = match &outcome {
            Ok(_) => (OperationStatus::Completed, OperationStatus::Completed.as_str()),
            Err(err) => (OperationStatus::Error, err.code.as_str()),
        };

        if let Err(e) = op.transition(next, now) {
            error!(%operation_id, "Terminal transition rejected: {}", e);
        }

        match outcome {
            Ok(result) => {
                info!(
                    %operation_id,
                    cashier_id = %op.cashier_id,
                    balance = %result.status,
                    difference = %result.cash_difference,
                    "Closing completed"
                );
                self.emit(
                    "operation_completed",
                    json!({
                        "operationId": operation_id,
                        "cashierId": op.cashier_id,
                        "recordId": result.record_id,
                        "status": result.status,
                        "cashDifference": result.cash_difference,
                    }),
                );
                op.result = Some(result);
            }
            Err(err) => {
                match err.code {
                    ErrorCode::ProcessingError | ErrorCode::LockError => {
                        error!(%operation_id, cashier_id = %op.cashier_id, code = %err.code, "Closing failed: {}", err.message)
                    }
                    _ => {
                        warn!(%operation_id, cashier_id = %op.cashier_id, code = %err.code, "Closing rejected: {}", err.message)
                    }
                }
                self.emit(
                    "operation_failed",
                    json!({
                        "operationId": operation_id,
                        "cashierId": op.cashier_id,
                        "code": err.code,
                        "message": err.message,
                    }),
                );
                op.error = Some(err);
            }
        }

        let elapsed = (now - op.started_at).to_std().unwrap_or_default();
        self.metrics.record_submission(label, elapsed.as_secs_f64());

        self.active.remove(operation_id);
        self.metrics.set_active(self.active.len());

        let outcome = op.outcome();
        self.history.append(HistoryEntry::from_operation(op));
        outcome
    }

    /// Operations not yet terminal or evicted
    pub fn list_active(&self) -> Vec<ActiveOperationView> {
        self.active.list(self.clock.now())
    }

    /// Page of history, newest first
    pub fn list_history(&self, query: &HistoryQuery) -> HistoryPage {
        self.history.query(query, self.max_page_size)
    }

    /// Operation by ID, active or historical
    pub fn get_operation(&self, id: Uuid) -> Result<PendingOperation> {
        self.active
            .get(id)
            .or_else(|| self.history.get(id).map(|entry| entry.operation))
            .ok_or(Error::OperationNotFound(id))
    }

    /// Registry and history counters
    pub fn stats(&self) -> OperationStats {
        OperationStats {
            active: self.active.len(),
            completed: self.history.count_status(OperationStatus::Completed),
            errored: self.history.count_status(OperationStatus::Error),
            history: self.history.len(),
        }
    }

    /// Release a cashier's locks without token verification
    pub async fn force_release(
        &self,
        caller: &PrivilegedCaller,
        cashier_id: &str,
        operation_type: Option<&str>,
    ) -> Result<usize> {
        self.locks.force_release(caller, cashier_id, operation_type).await
    }

    /// Drop active operations past their grace period. Locks are untouched.
    pub fn evict_stale(&self) -> usize {
        let evicted = self.active.evict(self.clock.now());

        for op in &evicted {
            if !op.status.is_terminal() {
                warn!(
                    operation_id = %op.operation_id,
                    cashier_id = %op.cashier_id,
                    status = %op.status,
                    "Evicting abandoned operation"
                );
            }
            self.emit(
                "operation_evicted",
                json!({ "operationId": op.operation_id, "status": op.status }),
            );
        }

        self.metrics.evicted_total.inc_by(evicted.len() as u64);
        self.metrics.set_active(self.active.len());
        evicted.len()
    }

    /// Drop history entries older than the retention window
    pub fn purge_history(&self) -> usize {
        let cutoff = self.clock.now() - self.history_retention;
        let purged = self.history.purge_older_than(cutoff);
        if purged > 0 {
            info!(purged, "Purged expired history entries");
        }
        self.metrics.history_purged_total.inc_by(purged as u64);
        purged
    }

    /// Lock manager
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Fingerprint validator
    pub fn fingerprints(&self) -> &FingerprintValidator {
        &self.fingerprints
    }

    /// Closing repository
    pub fn repository(&self) -> &Arc<dyn ClosingRepository> {
        &self.repository
    }

    fn emit(&self, event: &str, data: serde_json::Value) {
        self.sink
            .notify(Notification::at(self.source.as_str(), event, data, self.clock.now()));
    }
}

/// Time allowed between lock acquisition and release: 90% of the TTL
fn processing_deadline(lock_ttl: Duration) -> Duration {
    lock_ttl.saturating_sub(lock_ttl / 10)
}

/// Lock and uncommitted fingerprint of a submission in flight
struct InFlight {
    guard: Option<LockGuard>,
    fingerprints: FingerprintValidator,
    pending: Option<String>,
}

impl InFlight {
    fn new(guard: LockGuard, fingerprints: FingerprintValidator) -> Self {
        Self {
            guard: Some(guard),
            fingerprints,
            pending: None,
        }
    }

    /// Mark `digest` as recorded but not yet backed by a closing record
    fn reserve(&mut self, digest: &str) {
        self.pending = Some(digest.to_string());
    }

    /// The closing record is persisted; keep the fingerprint
    fn commit(&mut self) {
        self.pending = None;
    }

    /// Forget an uncommitted fingerprint, then release the lock
    async fn settle(mut self) -> Result<ReleaseOutcome> {
        if let Some(digest) = self.pending.take() {
            if let Err(e) = self.fingerprints.forget(&digest).await {
                warn!(fingerprint = %digest, "Failed to drop fingerprint: {}", e);
            }
        }
        match self.guard.take() {
            Some(guard) => guard.release().await,
            None => Ok(ReleaseOutcome::Rejected),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(digest) = self.pending.take() else {
            // Nothing to forget; the lock guard releases on its own drop
            return;
        };
        let guard = self.guard.take();
        let fingerprints = self.fingerprints.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fingerprints.forget(&digest).await {
                        warn!(fingerprint = %digest, "Deferred fingerprint drop failed: {}", e);
                    }
                    if let Some(guard) = guard {
                        if let Err(e) = guard.release().await {
                            warn!("Deferred lock release failed: {}", e);
                        }
                    }
                });
            }
            Err(_) => {
                warn!(fingerprint = %digest, "No runtime to drop abandoned fingerprint");
            }
        }
    }
}

fn processing_error(context: &str, err: &Error) -> OperationError {
    OperationError::new(ErrorCode::ProcessingError, format!("{}: {}", context, err))
}
