//! Comparison operators used by switch conditions.
//!
//! [`Comparator`] is the engine's seam; [`DefaultComparator`] implements the
//! full [`Operation`] set. Numeric ordering goes through `rust_decimal` so
//! `0.1 + 0.2`-style float artifacts never decide a branch. Time operations
//! accept RFC 3339 timestamps, `YYYY-MM-DD` dates, and unix seconds.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use waypoint_types::workflow::Operation;

use super::expression::value_to_string;

/// Errors from evaluating a comparison.
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error("'{0}' is not a valid time")]
    NotATime(String),

    #[error("'{0}' is not a whole amount")]
    InvalidAmount(String),

    #[error("a window of {0} reaches past the supported time range")]
    WindowOutOfRange(String),
}

/// Compares two resolved operands.
pub trait Comparator: Send + Sync {
    fn compare(&self, operation: Operation, left: &Value, right: &Value)
    -> Result<bool, CompareError>;
}

/// Built-in implementation of every [`Operation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl DefaultComparator {
    pub fn new() -> Self {
        Self
    }
}

impl Comparator for DefaultComparator {
    fn compare(
        &self,
        operation: Operation,
        left: &Value,
        right: &Value,
    ) -> Result<bool, CompareError> {
        let result = match operation {
            Operation::Equals => equals(left, right),
            Operation::NotEquals => !equals(left, right),
            Operation::Contains => contains(left, right, false),
            Operation::NotContains => !contains(left, right, false),
            Operation::ContainsIgnoreCase => contains(left, right, true),
            Operation::NotContainsIgnoreCase => !contains(left, right, true),
            Operation::StartsWith => value_to_string(left).starts_with(&value_to_string(right)),
            Operation::EndsWith => value_to_string(left).ends_with(&value_to_string(right)),
            Operation::Before => parse_time(left)? < parse_time(right)?,
            Operation::After => parse_time(left)? > parse_time(right)?,
            Operation::WithinLastDays => within_last(left, right, TimeDelta::try_days)?,
            Operation::WithinLastHours => within_last(left, right, TimeDelta::try_hours)?,
            Operation::WithinLastWeeks => within_last(left, right, TimeDelta::try_weeks)?,
            Operation::Empty => is_empty(left),
            Operation::NotEmpty => !is_empty(left),
            Operation::GreaterThan => parse_decimal(left)? > parse_decimal(right)?,
            Operation::LessThan => parse_decimal(left)? < parse_decimal(right)?,
            Operation::GreaterOrEqual => parse_decimal(left)? >= parse_decimal(right)?,
            Operation::LessOrEqual => parse_decimal(left)? <= parse_decimal(right)?,
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Operation helpers
// ---------------------------------------------------------------------------

fn equals(left: &Value, right: &Value) -> bool {
    if let (Ok(l), Ok(r)) = (parse_decimal(left), parse_decimal(right)) {
        return l == r;
    }
    value_to_string(left) == value_to_string(right)
}

fn contains(left: &Value, right: &Value, ignore_case: bool) -> bool {
    let needle = normalize(&value_to_string(right), ignore_case);
    match left {
        Value::Array(items) => items
            .iter()
            .any(|item| normalize(&value_to_string(item), ignore_case) == needle),
        other => normalize(&value_to_string(other), ignore_case).contains(&needle),
    }
}

fn normalize(s: &str, ignore_case: bool) -> String {
    if ignore_case {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// `window` builds the window length from the amount, `None` on overflow.
fn within_last(
    left: &Value,
    right: &Value,
    window: fn(i64) -> Option<TimeDelta>,
) -> Result<bool, CompareError> {
    let time = parse_time(left)?;
    let amount = parse_decimal(right)
        .ok()
        .filter(|d| d.fract().is_zero() && !d.is_sign_negative())
        .and_then(|d| d.to_i64())
        .ok_or_else(|| CompareError::InvalidAmount(value_to_string(right)))?;

    let now = Utc::now();
    let window_start = window(amount)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| CompareError::WindowOutOfRange(amount.to_string()))?;
    Ok(time >= window_start && time <= now)
}

fn parse_decimal(value: &Value) -> Result<Decimal, CompareError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(CompareError::NotANumber(value_to_string(other))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| CompareError::NotANumber(text))
}

fn parse_time(value: &Value) -> Result<DateTime<Utc>, CompareError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| CompareError::NotATime(n.to_string())),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                    return Ok(midnight.and_utc());
                }
            }
            s.parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| CompareError::NotATime(s.to_string()))
        }
        other => Err(CompareError::NotATime(value_to_string(other))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
