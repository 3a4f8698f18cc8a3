//! Reconciliation engine
//!
//! Pure arithmetic over [`Decimal`]. Every intermediate value is rounded to
//! two places half-up, so repeated calculations over the same inputs never
//! drift.

use crate::types::{round_money, BalanceStatus, CashAmounts};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum absolute difference still considered balanced (0.01)
pub const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Percentage variance above which a high-priority flag is raised
pub const HIGH_VARIANCE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Result of comparing reported cash against expected cash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashBalance {
    /// `initial + sales`
    pub expected_cash: Decimal,

    /// `reported - expected`
    pub cash_difference: Decimal,

    /// Difference as a percentage of expected; zero when nothing was expected
    pub percentage_difference: Decimal,

    /// Within tolerance
    pub balanced: bool,
}

impl CashBalance {
    /// Classification of this balance
    pub fn status(&self) -> BalanceStatus {
        classify(self.cash_difference)
    }
}

/// Recommendation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Drawer balances
    Confirmation,
    /// More cash than expected
    Surplus,
    /// Less cash than expected
    Shortage,
    /// Variance above the high-variance threshold
    HighVariance,
}

/// Recommendation priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Informational
    Info,
    /// Needs review
    Medium,
    /// Needs immediate review
    High,
}

/// Follow-up suggested to the cashier or supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Category
    pub kind: RecommendationKind,

    /// Priority
    pub priority: Priority,

    /// Human-readable message
    pub message: String,
}

/// `initial + sales`, rounded
pub fn expected_cash(initial_cash: Decimal, sales_total: Decimal) -> Decimal {
    round_money(initial_cash + sales_total)
}

/// Compare reported cash against expected cash
pub fn calculate(initial_cash: Decimal, sales_total: Decimal, reported_cash: Decimal) -> CashBalance {
    let expected = expected_cash(initial_cash, sales_total);
    let difference = round_money(round_money(reported_cash) - expected);

    let percentage = if expected > Decimal::ZERO {
        round_money(difference / expected * Decimal::ONE_HUNDRED)
    } else {
        Decimal::ZERO
    };

    CashBalance {
        expected_cash: expected,
        cash_difference: difference,
        percentage_difference: percentage,
        balanced: difference.abs() <= TOLERANCE,
    }
}

/// Reconcile validated amounts
pub fn reconcile(amounts: &CashAmounts) -> CashBalance {
    calculate(amounts.initial_cash, amounts.sales_total, amounts.reported_cash)
}

/// Balanced when `|difference| <= 0.01`
pub fn classify(difference: Decimal) -> BalanceStatus {
    if difference.abs() <= TOLERANCE {
        BalanceStatus::Balanced
    } else {
        BalanceStatus::Unbalanced
    }
}

/// Recommendations for a computed balance
pub fn recommend(balance: &CashBalance) -> Vec<Recommendation> {
    let difference = balance.cash_difference;
    let mut recommendations = Vec::new();

    if difference > TOLERANCE {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Surplus,
            priority: Priority::Medium,
            message: format!(
                "Surplus of {} detected; verify unrecorded sales or change given",
                difference
            ),
        });
    } else if difference < -TOLERANCE {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Shortage,
            priority: Priority::High,
            message: format!(
                "Shortage of {} detected; recount the drawer and review voided sales",
                difference.abs()
            ),
        });
    } else {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Confirmation,
            priority: Priority::Info,
            message: "Cash drawer balances".to_string(),
        });
    }

    if balance.percentage_difference.abs() > HIGH_VARIANCE_PERCENT {
        recommendations.push(Recommendation {
            kind: RecommendationKind::HighVariance,
            priority: Priority::High,
            message: format!(
                "Variance of {}% exceeds {}%; supervisor review required",
                balance.percentage_difference, HIGH_VARIANCE_PERCENT
            ),
        });
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_balanced() {
        let balance = calculate(dec("500"), dec("1200"), dec("1700"));
        assert_eq!(balance.expected_cash, dec("1700"));
        assert_eq!(balance.cash_difference, Decimal::ZERO);
        assert_eq!(balance.status(), BalanceStatus::Balanced);

        let recs = recommend(&balance);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::Confirmation);
    }

    #[test]
    fn test_unbalanced_shortage() {
        let balance = calculate(dec("500"), dec("1200"), dec("1650"));
        assert_eq!(balance.cash_difference, dec("-50"));
        assert_eq!(balance.percentage_difference, dec("-2.94"));
        assert_eq!(balance.status(), BalanceStatus::Unbalanced);

        let recs = recommend(&balance);
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::Shortage));
        assert!(!recs.iter().any(|r| r.kind == RecommendationKind::HighVariance));
    }

    #[test]
    fn test_tolerance_boundary() {
        let at = calculate(dec("100"), dec("0"), dec("100.01"));
        assert!(at.balanced);
        assert_eq!(at.status(), BalanceStatus::Balanced);

        let over = calculate(dec("100"), dec("0"), dec("100.02"));
        assert!(!over.balanced);
        assert_eq!(over.status(), BalanceStatus::Unbalanced);
        assert_eq!(recommend(&over)[0].kind, RecommendationKind::Surplus);
    }

    #[test]
    fn test_high_variance_flag() {
        let balance = calculate(dec("100"), dec("100"), dec("180"));
        assert_eq!(balance.percentage_difference, dec("-10"));

        let recs = recommend(&balance);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].kind, RecommendationKind::HighVariance);
        assert_eq!(recs[1].priority, Priority::High);
    }

    #[test]
    fn test_zero_expected_has_zero_percentage() {
        let balance = calculate(Decimal::ZERO, Decimal::ZERO, dec("20"));
        assert_eq!(balance.percentage_difference, Decimal::ZERO);
        assert_eq!(balance.status(), BalanceStatus::Unbalanced);
    }
}
