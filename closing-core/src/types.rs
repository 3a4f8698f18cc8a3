//! Core types for cash closing

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Round a monetary amount to 2 decimal places, half away from zero
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Largest amount accepted anywhere in a payload (1 000 000 000 000)
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Convert a wire amount into a rounded decimal.
/// Returns `None` for NaN and infinities.
pub fn money_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(round_money)
}

/// [`money_from_f64`], additionally rejecting magnitudes above [`MAX_AMOUNT`]
pub fn bounded_money(value: f64) -> Option<Decimal> {
    money_from_f64(value).filter(|amount| amount.abs() <= MAX_AMOUNT)
}

/// One line of a denomination count (e.g. 12 notes of 50.00)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Denomination {
    /// Face value of the note or coin
    pub value: f64,

    /// Number of units counted
    pub count: u32,
}

impl Denomination {
    /// `value × count`, rounded; `None` if the value is not finite or the
    /// product exceeds [`MAX_AMOUNT`]
    pub fn subtotal(&self) -> Option<Decimal> {
        bounded_money(self.value)?
            .checked_mul(Decimal::from(self.count))
            .map(round_money)
            .filter(|subtotal| *subtotal <= MAX_AMOUNT)
    }
}

/// Cash payload as submitted by the register.
///
/// Amounts stay raw JSON numbers so presence and finiteness can be validated
/// before anything is converted to [`Decimal`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashData {
    /// Float in the drawer when the session opened
    pub initial_cash: Option<f64>,

    /// Cash sales recorded during the session
    pub sales_total: Option<f64>,

    /// Cash counted at closing
    pub total_cash: Option<f64>,

    /// Optional breakdown of the counted cash
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denominations: Vec<Denomination>,
}

impl CashData {
    /// Payload with the three required amounts
    pub fn new(initial_cash: f64, sales_total: f64, total_cash: f64) -> Self {
        Self {
            initial_cash: Some(initial_cash),
            sales_total: Some(sales_total),
            total_cash: Some(total_cash),
            denominations: Vec::new(),
        }
    }

    /// Attach a denomination breakdown
    pub fn with_denominations(mut self, denominations: Vec<Denomination>) -> Self {
        self.denominations = denominations;
        self
    }

    /// Sum of the denomination breakdown.
    ///
    /// `None` when no breakdown was provided, or when a line or the total is
    /// out of range.
    pub fn denomination_total(&self) -> Option<Decimal> {
        if self.denominations.is_empty() {
            return None;
        }
        self.denominations
            .iter()
            .try_fold(Decimal::ZERO, |total, d| total.checked_add(d.subtotal()?))
            .map(round_money)
            .filter(|total| *total <= MAX_AMOUNT)
    }

    /// Normalized amounts; `None` if any required amount is missing, not
    /// finite or out of range
    pub fn amounts(&self) -> Option<CashAmounts> {
        let initial_cash = bounded_money(self.initial_cash?)?;
        let sales_total = bounded_money(self.sales_total?)?;
        let total_cash = bounded_money(self.total_cash?)?;
        let reported_cash = if self.denominations.is_empty() {
            total_cash
        } else {
            self.denomination_total()?
        };

        Some(CashAmounts {
            initial_cash,
            sales_total,
            total_cash,
            reported_cash,
        })
    }
}

/// Validated amounts in decimal form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashAmounts {
    /// Opening float
    pub initial_cash: Decimal,

    /// Cash sales
    pub sales_total: Decimal,

    /// Declared closing total
    pub total_cash: Decimal,

    /// Cash actually reported: the denomination sum when counted, else `total_cash`
    pub reported_cash: Decimal,
}

/// One failed validation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Offending field (camelCase, as on the wire)
    pub field: String,

    /// Human-readable description
    pub message: String,
}

impl Violation {
    /// Create new violation
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Balance classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceStatus {
    /// Difference within tolerance
    Balanced,
    /// Difference beyond tolerance
    Unbalanced,
}

impl BalanceStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStatus::Balanced => "BALANCED",
            BalanceStatus::Unbalanced => "UNBALANCED",
        }
    }
}

impl std::fmt::Display for BalanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable result of a successful closing. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingRecord {
    /// Record ID
    pub id: Uuid,

    /// Operation that produced the record
    pub operation_id: Uuid,

    /// Cashier
    pub cashier_id: String,

    /// Register session, if known
    pub session_id: Option<String>,

    /// Closing time
    pub timestamp: DateTime<Utc>,

    /// Opening float
    pub initial_cash: Decimal,

    /// Cash sales
    pub sales_total: Decimal,

    /// Cash reported at closing
    pub reported_cash: Decimal,

    /// `initial_cash + sales_total`
    pub expected_cash: Decimal,

    /// `reported_cash - expected_cash`
    pub cash_difference: Decimal,

    /// Difference as a percentage of expected cash
    pub percentage_difference: Decimal,

    /// Denomination breakdown as submitted
    pub denominations: Vec<Denomination>,

    /// Balance classification
    pub status: BalanceStatus,

    /// Submission fingerprint
    pub fingerprint: String,

    /// Free-form cashier notes
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(dec("1.005")), dec("1.01"));
        assert_eq!(round_money(dec("-1.005")), dec("-1.01"));
        assert_eq!(round_money(dec("2.004")), dec("2.00"));
    }

    #[test]
    fn test_money_from_f64_rejects_non_finite() {
        assert!(money_from_f64(f64::NAN).is_none());
        assert!(money_from_f64(f64::INFINITY).is_none());
        assert_eq!(money_from_f64(0.1 + 0.2), Some(dec("0.30")));
    }

    #[test]
    fn test_amounts_prefer_denominations() {
        let data = CashData::new(500.0, 1200.0, 1700.0).with_denominations(vec![
            Denomination { value: 100.0, count: 16 },
            Denomination { value: 50.0, count: 1 },
        ]);

        let amounts = data.amounts().unwrap();
        assert_eq!(amounts.total_cash, dec("1700"));
        assert_eq!(amounts.reported_cash, dec("1650"));
    }

    #[test]
    fn test_denomination_overflow_is_none() {
        let huge = Denomination { value: 5e19, count: 4_000_000_000 };
        assert!(huge.subtotal().is_none());

        let data = CashData::new(1.0, 1.0, 2.0).with_denominations(vec![huge]);
        assert!(data.denomination_total().is_none());
        assert!(data.amounts().is_none());

        // Each line in range, the sum is not
        let line = Denomination { value: 1e9, count: 600 };
        assert!(line.subtotal().is_some());
        let data = CashData::new(1.0, 1.0, 2.0).with_denominations(vec![line, line]);
        assert!(data.denomination_total().is_none());
    }

    #[test]
    fn test_amounts_missing_field() {
        let data = CashData {
            initial_cash: Some(10.0),
            sales_total: None,
            total_cash: Some(10.0),
            denominations: vec![],
        };
        assert!(data.amounts().is_none());
    }

    #[test]
    fn test_cash_data_wire_format() {
        let data: CashData = serde_json::from_str(
            r#"{"initialCash":1000,"salesTotal":500.5,"totalCash":1500.5}"#,
        )
        .unwrap();
        assert_eq!(data.sales_total, Some(500.5));
        assert!(data.denominations.is_empty());
    }
}
