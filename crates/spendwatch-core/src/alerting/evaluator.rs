//! Threshold evaluation
//!
//! Classifies a window total against its limit. Pure, no I/O.

use rust_decimal::Decimal;

use crate::models::{Severity, WindowTotal};

/// Default fraction of the limit at which spending counts as approaching
pub const DEFAULT_APPROACHING_RATIO: Decimal = Decimal::from_parts(8, 0, 0, false, 1);

/// Compares window totals against limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdEvaluator {
    approaching_ratio: Decimal,
}

impl Default for ThresholdEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_APPROACHING_RATIO)
    }
}

impl ThresholdEvaluator {
    /// Create an evaluator with the given approaching ratio
    pub fn new(approaching_ratio: Decimal) -> Self {
        Self { approaching_ratio }
    }

    /// Configured approaching ratio
    pub fn approaching_ratio(&self) -> Decimal {
        self.approaching_ratio
    }

    /// Severity of `total` against `limit`
    pub fn evaluate(&self, total: &WindowTotal, limit: Decimal) -> Severity {
        self.classify(total.sum_cost, limit)
    }

    /// Severity against an optional limit; `None` when the kind is not evaluated
    pub fn evaluate_limit(&self, total: &WindowTotal, limit: Option<Decimal>) -> Option<Severity> {
        limit.map(|limit| self.evaluate(total, limit))
    }

    fn classify(&self, sum: Decimal, limit: Decimal) -> Severity {
        if sum >= limit {
            Severity::Exceeded
        } else if sum >= self.approaching_ratio * limit {
            Severity::Approaching
        } else {
            Severity::Ok
        }
    }
}
