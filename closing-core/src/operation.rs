//! Operation state machine and outcome types

use crate::reconciliation::Recommendation;
use crate::types::{BalanceStatus, CashData, Violation};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation type used in lock scope keys for manual closings
pub const MANUAL_CASH_CLOSING: &str = "manual_cash_closing";

/// Closing operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Lock acquisition, validation and duplicate check
    Validating,
    /// Reconciliation and persistence
    Processing,
    /// Closing record written
    Completed,
    /// Rejected or failed
    Error,
}

impl OperationStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Error)
    }

    /// Legal transitions of the closing state machine
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Validating, Processing) | (Validating, Error) | (Processing, Completed) | (Processing, Error)
        )
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Validating => "VALIDATING",
            OperationStatus::Processing => "PROCESSING",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable rejection code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Payload failed structural or numeric validation
    InvalidInput,
    /// Same payload accepted recently
    DuplicateOperation,
    /// Lock held by another submission
    OperationInProgress,
    /// Lock infrastructure unavailable
    LockError,
    /// Failure after the lock was acquired
    ProcessingError,
}

impl ErrorCode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::DuplicateOperation => "DUPLICATE_OPERATION",
            ErrorCode::OperationInProgress => "OPERATION_IN_PROGRESS",
            ErrorCode::LockError => "LOCK_ERROR",
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Machine-readable code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Failed validation rules (only for `INVALID_INPUT`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl OperationError {
    /// Create new error without violations
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            violations: Vec::new(),
        }
    }

    /// `INVALID_INPUT` carrying the violation list
    pub fn invalid_input(violations: Vec<Violation>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: format!("Cash data failed validation ({} violations)", violations.len()),
            violations,
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of a completed closing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingResult {
    /// Persisted closing record
    pub record_id: Uuid,

    /// `initial + sales`
    pub expected_cash: Decimal,

    /// Cash reported at closing
    pub reported_cash: Decimal,

    /// `reported - expected`
    pub cash_difference: Decimal,

    /// Difference as a percentage of expected
    pub percentage_difference: Decimal,

    /// Balance classification
    pub status: BalanceStatus,

    /// Follow-ups
    pub recommendations: Vec<Recommendation>,
}

/// Closing submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Cashier closing the register
    pub cashier_id: String,

    /// Register session, if known
    pub session_id: Option<String>,

    /// Cash payload
    pub cash_data: CashData,

    /// Free-form notes
    pub notes: Option<String>,
}

impl SubmitRequest {
    /// Create request without session or notes
    pub fn new(cashier_id: impl Into<String>, cash_data: CashData) -> Self {
        Self {
            cashier_id: cashier_id.into(),
            session_id: None,
            cash_data,
            notes: None,
        }
    }

    /// Attach a session ID
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach notes
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Returned by `submit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    /// Operation ID, for traceability
    pub operation_id: Uuid,

    /// Terminal status
    pub status: OperationStatus,

    /// Present when `COMPLETED`
    pub result: Option<ClosingResult>,

    /// Present when `ERROR`
    pub error: Option<OperationError>,
}

impl SubmitOutcome {
    /// Whether the closing completed
    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }

    /// Rejection code, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Operation tracked in the active registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Operation ID
    pub operation_id: Uuid,

    /// Cashier
    pub cashier_id: String,

    /// Register session
    pub session_id: Option<String>,

    /// Current status
    pub status: OperationStatus,

    /// Payload as submitted
    pub payload: CashData,

    /// Cashier notes
    pub notes: Option<String>,

    /// Fingerprint, once computed
    pub fingerprint: Option<String>,

    /// Registration time
    pub started_at: DateTime<Utc>,

    /// Last transition time
    pub last_updated_at: DateTime<Utc>,

    /// Removal deadline from the active registry
    pub evict_at: DateTime<Utc>,

    /// Set on `COMPLETED`
    pub result: Option<ClosingResult>,

    /// Set on `ERROR`
    pub error: Option<OperationError>,
}

impl PendingOperation {
    /// New operation at `VALIDATING`
    pub fn new(
        request: &SubmitRequest,
        started_at: DateTime<Utc>,
        grace_period: chrono::Duration,
    ) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            cashier_id: request.cashier_id.clone(),
            session_id: request.session_id.clone(),
            status: OperationStatus::Validating,
            payload: request.cash_data.clone(),
            notes: request.notes.clone(),
            fingerprint: None,
            started_at,
            last_updated_at: started_at,
            evict_at: started_at + grace_period,
            result: None,
            error: None,
        }
    }

    /// Apply a state transition
    pub fn transition(&mut self, next: OperationStatus, at: DateTime<Utc>) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.last_updated_at = at;
        Ok(())
    }

    /// Whether the grace period has run out at `now`
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        now >= self.evict_at
    }

    /// Outcome as seen by the caller
    pub fn outcome(&self) -> SubmitOutcome {
        SubmitOutcome {
            operation_id: self.operation_id,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    /// Summary for `list_active`
    pub fn view(&self, now: DateTime<Utc>) -> ActiveOperationView {
        ActiveOperationView {
            operation_id: self.operation_id,
            cashier_id: self.cashier_id.clone(),
            status: self.status,
            start_time: self.started_at,
            duration_ms: (now - self.started_at).num_milliseconds().max(0),
        }
    }
}

/// Terminal snapshot kept in the history log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Final operation state
    pub operation: PendingOperation,

    /// Time the operation reached its terminal state
    pub completed_at: DateTime<Utc>,

    /// `completed_at - started_at` in milliseconds
    pub processing_time_ms: i64,
}

impl HistoryEntry {
    /// Snapshot a terminal operation
    pub fn from_operation(operation: PendingOperation) -> Self {
        let completed_at = operation.last_updated_at;
        let processing_time_ms = (completed_at - operation.started_at).num_milliseconds().max(0);
        Self {
            operation,
            completed_at,
            processing_time_ms,
        }
    }

    /// Operation ID
    pub fn operation_id(&self) -> Uuid {
        self.operation.operation_id
    }

    /// Cashier
    pub fn cashier_id(&self) -> &str {
        &self.operation.cashier_id
    }

    /// Terminal status
    pub fn status(&self) -> OperationStatus {
        self.operation.status
    }

    /// Summary for `list_history`
    pub fn summary(&self) -> HistorySummary {
        HistorySummary {
            operation_id: self.operation.operation_id,
            cashier_id: self.operation.cashier_id.clone(),
            status: self.operation.status,
            processing_time_ms: self.processing_time_ms,
            completed_at: self.completed_at,
            balance: self.operation.result.as_ref().map(|r| r.status),
            cash_difference: self.operation.result.as_ref().map(|r| r.cash_difference),
            error_code: self.operation.error.as_ref().map(|e| e.code),
        }
    }
}

/// One row of `list_active`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOperationView {
    /// Operation ID
    pub operation_id: Uuid,
    /// Cashier
    pub cashier_id: String,
    /// Current status
    pub status: OperationStatus,
    /// Registration time
    pub start_time: DateTime<Utc>,
    /// Time since registration
    pub duration_ms: i64,
}

/// One row of `list_history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    /// Operation ID
    pub operation_id: Uuid,
    /// Cashier
    pub cashier_id: String,
    /// Terminal status
    pub status: OperationStatus,
    /// Processing time in milliseconds
    pub processing_time_ms: i64,
    /// Terminal time
    pub completed_at: DateTime<Utc>,
    /// Balance classification when completed
    pub balance: Option<BalanceStatus>,
    /// Cash difference when completed
    pub cash_difference: Option<Decimal>,
    /// Rejection code when errored
    pub error_code: Option<ErrorCode>,
}

/// History filter and page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// Only this cashier
    pub cashier_id: Option<String>,
    /// Page size; defaults to 20, capped by configuration
    pub limit: Option<usize>,
    /// Entries to skip
    #[serde(default)]
    pub offset: usize,
}

impl HistoryQuery {
    /// Default page size
    pub const DEFAULT_LIMIT: usize = 20;

    /// Query for one cashier
    pub fn for_cashier(cashier_id: impl Into<String>) -> Self {
        Self {
            cashier_id: Some(cashier_id.into()),
            ..Default::default()
        }
    }
}

/// Page of history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Matching entries before paging
    pub total: usize,
    /// Page content, newest first
    pub entries: Vec<HistorySummary>,
}

/// Orchestrator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    /// Operations currently in the active registry
    pub active: usize,
    /// Completed operations in history
    pub completed: usize,
    /// Errored operations in history
    pub errored: usize,
    /// Total history entries
    pub history: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use OperationStatus::*;
        assert!(Validating.can_transition_to(Processing));
        assert!(Validating.can_transition_to(Error));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));

        assert!(!Validating.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Validating));
    }

    #[test]
    fn test_pending_operation_rejects_illegal_transition() {
        let now = Utc::now();
        let request = SubmitRequest::new("C1", CashData::new(1.0, 1.0, 2.0));
        let mut op = PendingOperation::new(&request, now, chrono::Duration::minutes(5));

        assert!(op.transition(OperationStatus::Completed, now).is_err());
        op.transition(OperationStatus::Processing, now).unwrap();
        op.transition(OperationStatus::Completed, now).unwrap();
        assert!(op.status.is_terminal());
        assert_eq!(op.evict_at, now + chrono::Duration::minutes(5));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&OperationStatus::Processing).unwrap(), "\"PROCESSING\"");
        assert_eq!(
            serde_json::to_string(&ErrorCode::OperationInProgress).unwrap(),
            "\"OPERATION_IN_PROGRESS\""
        );
        assert_eq!(ErrorCode::DuplicateOperation.to_string(), "DUPLICATE_OPERATION");
    }
}
