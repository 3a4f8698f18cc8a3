//! Cash payload validation and duplicate detection
//!
//! Structural validation and duplicate detection are separate gates: a payload
//! that fails validation never reaches the fingerprint store, and a valid
//! payload can still be rejected as a duplicate.

use crate::reconciliation::TOLERANCE;
use crate::store::BackingStore;
use crate::types::{bounded_money, CashAmounts, CashData, Violation, MAX_AMOUNT};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FINGERPRINT_PREFIX: &str = "fingerprint:";

/// Check presence, finiteness, sign and internal consistency of a payload
pub fn validate_cash_data(payload: &CashData) -> Vec<Violation> {
    let mut violations = Vec::new();

    let initial = check_amount("initialCash", payload.initial_cash, &mut violations);
    let sales = check_amount("salesTotal", payload.sales_total, &mut violations);
    let total = check_amount("totalCash", payload.total_cash, &mut violations);

    if let (Some(initial), Some(sales), Some(total)) = (initial, sales, total) {
        // Both operands are bounded by MAX_AMOUNT
        let expected = initial + sales;
        if (total - expected).abs() > TOLERANCE {
            violations.push(Violation::new(
                "totalCash",
                format!(
                    "must equal initialCash + salesTotal ({}), got {}",
                    expected, total
                ),
            ));
        }
    }

    let mut lines_ok = true;
    for (i, denomination) in payload.denominations.iter().enumerate() {
        if !denomination.value.is_finite() || denomination.value <= 0.0 {
            lines_ok = false;
            violations.push(Violation::new(
                format!("denominations[{}].value", i),
                "must be a finite positive number",
            ));
        } else if denomination.subtotal().is_none() {
            lines_ok = false;
            violations.push(Violation::new(
                format!("denominations[{}]", i),
                format!("value × count is out of range (max {})", MAX_AMOUNT),
            ));
        }
    }

    if lines_ok && !payload.denominations.is_empty() && payload.denomination_total().is_none() {
        violations.push(Violation::new(
            "denominations",
            format!("total is out of range (max {})", MAX_AMOUNT),
        ));
    }

    violations
}

fn check_amount(
    field: &str,
    value: Option<f64>,
    violations: &mut Vec<Violation>,
) -> Option<rust_decimal::Decimal> {
    let Some(value) = value else {
        violations.push(Violation::new(field, "is required"));
        return None;
    };

    if !value.is_finite() {
        violations.push(Violation::new(field, "must be a finite number"));
        return None;
    }

    if value < 0.0 {
        violations.push(Violation::new(field, "must not be negative"));
        return None;
    }

    let amount = bounded_money(value);
    if amount.is_none() {
        violations.push(Violation::new(field, format!("is out of range (max {})", MAX_AMOUNT)));
    }
    amount
}

/// SHA-256 hex digest of cashier, normalized totals and the minute bucket.
///
/// Two submissions in the same minute with the same totals collide; the same
/// totals a minute later do not.
pub fn compute_fingerprint(cashier_id: &str, totals: &CashAmounts, timestamp: DateTime<Utc>) -> String {
    let bucket = timestamp.timestamp().div_euclid(60);

    let mut hasher = Sha256::new();
    hasher.update(cashier_id.as_bytes());
    hasher.update(b"|");
    hasher.update(
        format!(
            "{:.2}|{:.2}|{:.2}|{:.2}",
            totals.initial_cash, totals.sales_total, totals.total_cash, totals.reported_cash
        )
        .as_bytes(),
    );
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());

    format!("{:x}", hasher.finalize())
}

/// Value stored under a recorded fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintEntry {
    /// Accepted payload
    pub payload: CashData,
    /// Acceptance time
    pub recorded_at: DateTime<Utc>,
}

/// Records accepted fingerprints for the dedupe window
#[derive(Clone)]
pub struct FingerprintValidator {
    store: Arc<dyn BackingStore>,
    window: Duration,
}

impl FingerprintValidator {
    /// Create validator over `store`
    pub fn new(store: Arc<dyn BackingStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Dedupe window
    pub fn window(&self) -> Duration {
        self.window
    }

    fn key(digest: &str) -> String {
        format!("{}{}", FINGERPRINT_PREFIX, digest)
    }

    /// Whether `digest` was recorded within the window
    pub async fn check_duplicate(&self, digest: &str) -> Result<bool> {
        self.store.exists(&Self::key(digest)).await
    }

    /// Record `digest` for the dedupe window
    pub async fn record(&self, digest: &str, payload: &CashData, at: DateTime<Utc>) -> Result<()> {
        let entry = FingerprintEntry {
            payload: payload.clone(),
            recorded_at: at,
        };
        let value = serde_json::to_string(&entry)?;
        self.store.set(&Self::key(digest), &value, Some(self.window)).await?;
        debug!(fingerprint = %digest, "Fingerprint recorded");
        Ok(())
    }

    /// Recorded entry for `digest`
    pub async fn lookup(&self, digest: &str) -> Result<Option<FingerprintEntry>> {
        match self.store.get(&Self::key(digest)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Drop a recorded fingerprint so the same payload can be resubmitted
    pub async fn forget(&self, digest: &str) -> Result<bool> {
        self.store.delete(&Self::key(digest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::Denomination;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_valid_payload() {
        assert!(validate_cash_data(&CashData::new(1000.0, 500.0, 1500.0)).is_empty());
        assert!(validate_cash_data(&CashData::new(0.1, 0.2, 0.3)).is_empty());
    }

    #[test]
    fn test_missing_and_non_finite() {
        let payload = CashData {
            initial_cash: None,
            sales_total: Some(f64::NAN),
            total_cash: Some(f64::INFINITY),
            denominations: vec![],
        };
        let violations = validate_cash_data(&payload);
        let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["initialCash", "salesTotal", "totalCash"]);
    }

    #[test]
    fn test_negative_amounts() {
        for payload in [
            CashData::new(-1.0, 1.0, 0.0),
            CashData::new(1.0, -1.0, 0.0),
            CashData::new(1.0, 1.0, -2.0),
        ] {
            let violations = validate_cash_data(&payload);
            assert!(violations.iter().any(|v| v.message.contains("negative")));
        }
    }

    #[test]
    fn test_total_mismatch() {
        assert!(validate_cash_data(&CashData::new(100.0, 50.0, 150.01)).is_empty());

        let violations = validate_cash_data(&CashData::new(100.0, 50.0, 150.02));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "totalCash");
    }

    #[test]
    fn test_bad_denomination() {
        let payload = CashData::new(1.0, 1.0, 2.0)
            .with_denominations(vec![Denomination { value: 0.0, count: 2 }]);
        let violations = validate_cash_data(&payload);
        assert_eq!(violations[0].field, "denominations[0].value");
    }

    #[test]
    fn test_denomination_out_of_range() {
        let payload = CashData::new(1.0, 1.0, 2.0)
            .with_denominations(vec![Denomination { value: 5e19, count: 4_000_000_000 }]);
        let violations = validate_cash_data(&payload);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "denominations[0]");

        let line = Denomination { value: 1e9, count: 600 };
        let payload = CashData::new(1.0, 1.0, 2.0).with_denominations(vec![line, line]);
        let violations = validate_cash_data(&payload);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "denominations");
    }

    #[test]
    fn test_amount_above_ceiling() {
        let violations = validate_cash_data(&CashData::new(1e13, 0.0, 1e13));
        assert!(violations
            .iter()
            .any(|v| v.field == "initialCash" && v.message.contains("out of range")));
    }

    #[test]
    fn test_fingerprint_minute_bucket() {
        let amounts = CashData::new(1000.0, 500.0, 1500.0).amounts().unwrap();

        let a = compute_fingerprint("C1", &amounts, at(9, 30, 1));
        let b = compute_fingerprint("C1", &amounts, at(9, 30, 59));
        let c = compute_fingerprint("C1", &amounts, at(9, 31, 0));
        let d = compute_fingerprint("C2", &amounts, at(9, 30, 1));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_normalizes_amounts() {
        let a = CashData::new(1000.0, 500.0, 1500.0).amounts().unwrap();
        let b = CashData::new(1000.004, 500.0, 1500.0).amounts().unwrap();
        assert_eq!(
            compute_fingerprint("C1", &a, at(9, 0, 0)),
            compute_fingerprint("C1", &b, at(9, 0, 0))
        );
    }

    #[tokio::test]
    async fn test_record_expires_after_window() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let validator = FingerprintValidator::new(store, Duration::from_secs(30 * 60));
        let payload = CashData::new(1.0, 1.0, 2.0);

        assert!(!validator.check_duplicate("abc").await.unwrap());
        validator.record("abc", &payload, Utc::now()).await.unwrap();
        assert!(validator.check_duplicate("abc").await.unwrap());
        assert_eq!(validator.lookup("abc").await.unwrap().unwrap().payload, payload);

        clock.advance(Duration::from_secs(29 * 60));
        assert!(validator.check_duplicate("abc").await.unwrap());

        clock.advance(Duration::from_secs(2 * 60));
        assert!(!validator.check_duplicate("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_forget() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::default())));
        let validator = FingerprintValidator::new(store, Duration::from_secs(60));

        validator.record("abc", &CashData::new(1.0, 1.0, 2.0), Utc::now()).await.unwrap();
        assert!(validator.forget("abc").await.unwrap());
        assert!(!validator.check_duplicate("abc").await.unwrap());
    }
}
