//! Branch condition evaluation.
//!
//! Both operands arrive as already-interpolated strings. List operators split
//! the right side on commas and compare case-insensitively; everything else
//! is a plain case-sensitive string comparison. Numeric operators parse both
//! sides as floats and evaluate false when either side is not a number.

use serde::{Deserialize, Serialize};

/// Comparison operator for AddCondition nodes.
///
/// The set is closed: an unknown operator string fails definition
/// deserialization, so a malformed flow is rejected before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    IsOneOf,
    IsNotOneOf,
    GreaterThan,
    LessThan,
}

/// Evaluate `left <op> right`
pub fn evaluate(operator: ConditionOperator, left: &str, right: &str) -> bool {
    match operator {
        ConditionOperator::Equals => left == right,
        ConditionOperator::NotEquals => left != right,
        ConditionOperator::Contains => left.contains(right),
        ConditionOperator::IsOneOf => in_list(left, right),
        ConditionOperator::IsNotOneOf => !in_list(left, right),
        ConditionOperator::GreaterThan => numeric(left, right).map_or(false, |(l, r)| l > r),
        ConditionOperator::LessThan => numeric(left, right).map_or(false, |(l, r)| l < r),
    }
}

fn in_list(left: &str, list: &str) -> bool {
    let needle = left.to_lowercase();
    list.split(',')
        .map(|entry| entry.trim().to_lowercase())
        .any(|entry| entry == needle)
}

fn numeric(left: &str, right: &str) -> Option<(f64, f64)> {
    let l = left.trim().parse::<f64>().ok()?;
    let r = right.trim().parse::<f64>().ok()?;
    Some((l, r))
}
