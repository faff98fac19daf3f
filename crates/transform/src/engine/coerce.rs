//! Primitive coercions.
//!
//! Coercions are total over their declared domain and fail everywhere else.
//! Numeric text is checked as an exact decimal and emitted with its original
//! digits, never through a float, so no value is truncated or rounded.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value};

use crate::error::TransformationError;
use crate::rules::CoerceTarget;

/// Converts `value` to `target`.
pub(crate) fn coerce(
    value: &Value,
    target: CoerceTarget,
    path: &str,
) -> Result<Value, TransformationError> {
    let out_of_domain = |message: String| TransformationError::CoercionOutOfDomain {
        path: path.to_string(),
        target,
        message,
    };

    match (target, value) {
        (CoerceTarget::String, Value::String(_)) => Ok(value.clone()),
        (CoerceTarget::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (CoerceTarget::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (CoerceTarget::Integer, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
        (CoerceTarget::Integer, Value::Number(n)) => {
            to_integer(&n.to_string()).map_err(out_of_domain)
        }
        (CoerceTarget::Integer, Value::String(s)) => to_integer(s).map_err(out_of_domain),

        (CoerceTarget::Decimal, Value::Number(_)) => Ok(value.clone()),
        (CoerceTarget::Decimal, Value::String(s)) => to_decimal(s).map_err(out_of_domain),

        (CoerceTarget::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (CoerceTarget::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(out_of_domain(format!("'{}' is not a boolean literal", other))),
        },

        (_, other) => Err(out_of_domain(format!("{} values are not coercible", kind(other)))),
    }
}

fn parse_decimal(text: &str) -> Result<Decimal, String> {
    let trimmed = text.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|e| format!("'{}' is not a number: {}", text, e))
}

fn to_integer(text: &str) -> Result<Value, String> {
    let decimal = parse_decimal(text)?;
    if !decimal.fract().is_zero() {
        return Err(format!("'{}' has a fractional part", text));
    }
    decimal
        .to_i64()
        .map(|i| Value::Number(i.into()))
        .ok_or_else(|| format!("'{}' is outside the 64-bit integer range", text))
}

fn to_decimal(text: &str) -> Result<Value, String> {
    let decimal = parse_decimal(text)?;
    // Keep the literal so precision and trailing zeros survive ("12.50").
    Number::from_str(text.trim())
        .or_else(|_| Number::from_str(&decimal.to_string()))
        .map(Value::Number)
        .map_err(|e| format!("'{}' is not representable as a JSON number: {}", text, e))
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
