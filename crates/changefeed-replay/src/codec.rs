//! JSON to typed value conversion.
//!
//! [`decode`] turns one JSON node of a change event into a [`TypedValue`] of
//! the declared [`ColumnType`]. [`encode`] is the inverse rendering used by
//! the changefeed for the same types, so `decode(encode(v)) == v`.
//!
//! | Column type                    | Accepted JSON                          |
//! |--------------------------------|----------------------------------------|
//! | `Bool`                         | `true` / `false`                       |
//! | `Int*`, `Uint*`, `Float`, `Double` | number or numeric string           |
//! | `Text`                         | string (numbers and booleans as text)  |
//! | `Bytes`                        | base64 string                          |
//! | `Json`, `JsonDocument`         | any node, stored as canonical text     |
//! | `Uuid`                         | string                                 |
//! | `Date`, `Datetime`, `Timestamp`| RFC-3339 string                        |
//! | `Interval`                     | integer seconds                        |
//! | `Decimal(p, s)`                | string or number                       |

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{ColumnType, TypedValue};

/// Decodes a JSON node into a value of the given column type.
///
/// A missing node and JSON `null` are the same thing: the empty value for
/// `Optional<T>`, an error for anything else.
///
/// # Errors
///
/// Returns [`DecodeError::UnsupportedType`] for types without a JSON form and
/// [`DecodeError::MalformedValue`] when the node's shape does not match.
pub fn decode(node: Option<&Value>, ty: &ColumnType) -> Result<TypedValue, DecodeError> {
    if let ColumnType::Optional(inner) = ty {
        return match node {
            None | Some(Value::Null) => Ok(TypedValue::none()),
            Some(value) => decode(Some(value), inner).map(TypedValue::some),
        };
    }

    if !ty.is_decodable() {
        return Err(DecodeError::UnsupportedType { ty: ty.to_string() });
    }

    let value = match node {
        None | Some(Value::Null) => {
            return Err(DecodeError::malformed(ty, &Value::Null, "null value for non-optional type"));
        }
        Some(value) => value,
    };

    match ty {
        ColumnType::Bool => value
            .as_bool()
            .map(TypedValue::Bool)
            .ok_or_else(|| DecodeError::malformed(ty, value, "expected boolean")),

        ColumnType::Int8 => read_int(value, ty).map(TypedValue::Int8),
        ColumnType::Int16 => read_int(value, ty).map(TypedValue::Int16),
        ColumnType::Int32 => read_int(value, ty).map(TypedValue::Int32),
        ColumnType::Int64 => read_int(value, ty).map(TypedValue::Int64),
        ColumnType::Uint8 => read_uint(value, ty).map(TypedValue::Uint8),
        ColumnType::Uint16 => read_uint(value, ty).map(TypedValue::Uint16),
        ColumnType::Uint32 => read_uint(value, ty).map(TypedValue::Uint32),
        ColumnType::Uint64 => read_uint(value, ty).map(TypedValue::Uint64),

        ColumnType::Float => {
            let wide = read_float(value, ty)?;
            #[allow(clippy::cast_possible_truncation)]
            let narrow = wide as f32;
            if wide.is_finite() && !narrow.is_finite() {
                return Err(DecodeError::malformed(ty, value, "float out of range"));
            }
            Ok(TypedValue::Float(narrow))
        }
        ColumnType::Double => read_float(value, ty).map(TypedValue::Double),

        ColumnType::Text => match value {
            Value::String(s) => Ok(TypedValue::Text(s.clone())),
            Value::Number(_) | Value::Bool(_) => Ok(TypedValue::Text(value.to_string())),
            _ => Err(DecodeError::malformed(ty, value, "expected string")),
        },
        ColumnType::Bytes => {
            let text = read_str(value, ty)?;
            BASE64
                .decode(text)
                .map(TypedValue::Bytes)
                .map_err(|e| DecodeError::malformed(ty, value, format!("invalid base64: {e}")))
        }
        ColumnType::Json => Ok(TypedValue::Json(value.to_string())),
        ColumnType::JsonDocument => Ok(TypedValue::JsonDocument(value.to_string())),
        ColumnType::Uuid => {
            let text = read_str(value, ty)?;
            Uuid::parse_str(text)
                .map(TypedValue::Uuid)
                .map_err(|e| DecodeError::malformed(ty, value, e.to_string()))
        }

        ColumnType::Date => {
            let text = read_str(value, ty)?;
            match parse_instant(text) {
                Some(instant) => Ok(TypedValue::Date(instant.date_naive())),
                None => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(TypedValue::Date)
                    .map_err(|e| DecodeError::malformed(ty, value, e.to_string())),
            }
        }
        ColumnType::Datetime => read_instant(value, ty)
            .map(|instant| TypedValue::Datetime(instant.trunc_subsecs(0).naive_utc())),
        ColumnType::Timestamp => {
            read_instant(value, ty).map(|instant| TypedValue::Timestamp(instant.trunc_subsecs(6)))
        }
        ColumnType::Interval => {
            let seconds: i64 = read_int(value, ty)?;
            TimeDelta::try_seconds(seconds)
                .map(TypedValue::Interval)
                .ok_or_else(|| DecodeError::malformed(ty, value, "interval out of range"))
        }

        ColumnType::Decimal { precision, scale } => {
            read_decimal(value, ty, *precision, *scale).map(TypedValue::Decimal)
        }

        // Rejected by `is_decodable` above.
        _ => Err(DecodeError::UnsupportedType { ty: ty.to_string() }),
    }
}

/// Renders a typed value the way the changefeed writes it.
///
/// Structs render as arrays in member order.
#[must_use]
pub fn encode(value: &TypedValue) -> Value {
    match value {
        TypedValue::Bool(v) => Value::Bool(*v),
        TypedValue::Int8(v) => Value::from(*v),
        TypedValue::Int16(v) => Value::from(*v),
        TypedValue::Int32(v) => Value::from(*v),
        TypedValue::Int64(v) => Value::from(*v),
        TypedValue::Uint8(v) => Value::from(*v),
        TypedValue::Uint16(v) => Value::from(*v),
        TypedValue::Uint32(v) => Value::from(*v),
        TypedValue::Uint64(v) => Value::from(*v),
        TypedValue::Float(v) => Value::from(f64::from(*v)),
        TypedValue::Double(v) => Value::from(*v),
        TypedValue::Text(v) => Value::String(v.clone()),
        TypedValue::Bytes(v) => Value::String(BASE64.encode(v)),
        TypedValue::Json(v) | TypedValue::JsonDocument(v) => {
            serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
        }
        TypedValue::Uuid(v) => Value::String(v.to_string()),
        TypedValue::Date(v) => Value::String(format!("{v}T00:00:00Z")),
        TypedValue::Datetime(v) => {
            Value::String(v.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        TypedValue::Timestamp(v) => Value::String(v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        TypedValue::Interval(v) => Value::from(v.num_seconds()),
        TypedValue::Decimal(v) => Value::String(v.to_string()),
        TypedValue::Optional(None) => Value::Null,
        TypedValue::Optional(Some(inner)) => encode(inner),
        TypedValue::List(items) | TypedValue::Struct(items) => {
            Value::Array(items.iter().map(encode).collect())
        }
    }
}

fn read_str<'a>(value: &'a Value, ty: &ColumnType) -> Result<&'a str, DecodeError> {
    value
        .as_str()
        .ok_or_else(|| DecodeError::malformed(ty, value, "expected string"))
}

fn read_int<T>(value: &Value, ty: &ColumnType) -> Result<T, DecodeError>
where
    T: TryFrom<i64>,
{
    let wide = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::malformed(ty, value, "expected integer"))?;
    T::try_from(wide).map_err(|_| DecodeError::malformed(ty, value, "integer out of range"))
}

fn read_uint<T>(value: &Value, ty: &ColumnType) -> Result<T, DecodeError>
where
    T: TryFrom<u64>,
{
    let wide = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::malformed(ty, value, "expected unsigned integer"))?;
    T::try_from(wide).map_err(|_| DecodeError::malformed(ty, value, "integer out of range"))
}

fn read_float(value: &Value, ty: &ColumnType) -> Result<f64, DecodeError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::malformed(ty, value, "expected number"))
}

/// Parses a decimal and rounds it half-even to `scale`.
///
/// Magnitudes are checked on the unscaled digits first: rescaling a value
/// like `1e1000000000` would materialize the full power of ten.
fn read_decimal(
    value: &Value,
    ty: &ColumnType,
    precision: u8,
    scale: u8,
) -> Result<BigDecimal, DecodeError> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(DecodeError::malformed(ty, value, "expected decimal text")),
    };
    let parsed = BigDecimal::from_str(text.trim())
        .map_err(|e| DecodeError::malformed(ty, value, e.to_string()))?;
    let too_wide =
        || DecodeError::malformed(ty, value, format!("value does not fit precision {precision}"));

    let scale = i64::from(scale);
    let (mantissa, exponent) = parsed.as_bigint_and_exponent();
    let mantissa = mantissa.to_string();
    let mantissa = mantissa.trim_start_matches('-');
    if mantissa == "0" {
        return Ok(BigDecimal::from(0).with_scale(scale));
    }
    // value = mantissa * 10^-exponent
    let digits = i64::try_from(mantissa.len()).unwrap_or(i64::MAX);
    if digits.saturating_sub(exponent) > i64::from(precision) - scale {
        return Err(too_wide());
    }
    // Everything below a tenth of the last kept digit rounds to zero.
    if exponent.saturating_sub(scale) > digits {
        return Ok(BigDecimal::from(0).with_scale(scale));
    }

    let scaled = parsed.with_scale_round(scale, RoundingMode::HalfEven);
    // Rounding can carry into one more digit.
    if scaled.digits() > u64::from(precision) {
        return Err(too_wide());
    }
    Ok(scaled)
}

fn read_instant(value: &Value, ty: &ColumnType) -> Result<DateTime<Utc>, DecodeError> {
    let text = read_str(value, ty)?;
    parse_instant(text).ok_or_else(|| DecodeError::malformed(ty, value, "expected RFC-3339 time"))
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
