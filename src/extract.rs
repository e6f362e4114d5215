//! Value extraction from nested records
//!
//! Columns address their value by a property path relative to the element a
//! row is built from. With translation enabled values are coerced to the
//! column's scalar type; values that cannot be coerced are treated as absent
//! and end up as `null` in the row.

use serde_json::{Number, Value};

use crate::models::{ScalarType, ValueColumn};

/// Follow `path` from `element`.
///
/// An empty path addresses the element itself. JSON `null` is treated as
/// absent.
pub fn navigate<'a, S: AsRef<str>>(element: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = element;
    for segment in path {
        current = current.as_object()?.get(segment.as_ref())?;
    }
    if current.is_null() { None } else { Some(current) }
}

/// Extract the value of `column` from `element`.
///
/// # Arguments
///
/// * `element` - Record or array element the row is built from
/// * `column` - Column describing path and scalar type
/// * `translate` - Coerce to the column's scalar type
///
/// # Returns
///
/// `None` when the path is absent or the value cannot be coerced.
pub fn extract_value(element: &Value, column: &ValueColumn, translate: bool) -> Option<Value> {
    let raw = navigate(element, &column.source_path)?;
    if !translate {
        return Some(raw.clone());
    }
    coerce(raw, column.scalar_type)
}

/// Coerce a present value to `scalar_type`
pub fn coerce(raw: &Value, scalar_type: ScalarType) -> Option<Value> {
    match scalar_type {
        ScalarType::String => Some(match raw {
            Value::String(_) => raw.clone(),
            other => Value::String(other.to_string()),
        }),
        ScalarType::Boolean => Some(Value::from(u8::from(is_truthy(raw)))),
        ScalarType::Integer => to_integer(raw).map(Value::from),
        ScalarType::Number => to_float(raw)
            .and_then(Number::from_f64)
            .map(Value::Number),
        ScalarType::Json => Some(match raw {
            Value::String(_) => raw.clone(),
            other => Value::String(other.to_string()),
        }),
    }
}

fn is_truthy(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        Value::Number(n) => n.as_i64() == Some(1) || n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn to_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    // Guards "NaN" and "inf" strings as well
    value.is_finite().then_some(value)
}
