//! Column types and typed values of the target database.
//!
//! [`ColumnType`] mirrors the target's type system closely enough for schema
//! validation: two types are compatible only when they are equal, so widths,
//! decimal precision and optionality all take part in the comparison.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use uuid::Uuid;

/// A target column or parameter type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// `Bool`.
    Bool,
    /// `Int8`.
    Int8,
    /// `Int16`.
    Int16,
    /// `Int32`.
    Int32,
    /// `Int64`.
    Int64,
    /// `Uint8`.
    Uint8,
    /// `Uint16`.
    Uint16,
    /// `Uint32`.
    Uint32,
    /// `Uint64`.
    Uint64,
    /// `Float` (32-bit).
    Float,
    /// `Double` (64-bit).
    Double,
    /// `Text` (UTF-8 string).
    Text,
    /// `Bytes` (binary string).
    Bytes,
    /// `Json`.
    Json,
    /// `JsonDocument`.
    JsonDocument,
    /// `Uuid`.
    Uuid,
    /// `Date` (day precision).
    Date,
    /// `Datetime` (second precision).
    Datetime,
    /// `Timestamp` (microsecond precision).
    Timestamp,
    /// `Interval` (microsecond precision).
    Interval,
    /// `Decimal(precision, scale)`.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
    /// `TzDate`; not decodable.
    TzDate,
    /// `TzDatetime`; not decodable.
    TzDatetime,
    /// `TzTimestamp`; not decodable.
    TzTimestamp,
    /// `DyNumber`; not decodable.
    DyNumber,
    /// `Yson`; not decodable.
    Yson,
    /// `Optional<T>`.
    Optional(Box<ColumnType>),
    /// `List<T>`; only used for query parameters.
    List(Box<ColumnType>),
    /// `Struct<...>`; only used for query parameters.
    Struct(StructType),
}

impl ColumnType {
    /// Wraps a type in `Optional<...>`.
    #[must_use]
    pub fn optional(inner: ColumnType) -> Self {
        ColumnType::Optional(Box::new(inner))
    }

    /// Wraps a type in `List<...>`.
    #[must_use]
    pub fn list(item: ColumnType) -> Self {
        ColumnType::List(Box::new(item))
    }

    /// Returns `true` for `Optional<...>`.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        matches!(self, ColumnType::Optional(_))
    }

    /// Returns `true` if the codec can decode this type from JSON.
    #[must_use]
    pub fn is_decodable(&self) -> bool {
        match self {
            ColumnType::TzDate
            | ColumnType::TzDatetime
            | ColumnType::TzTimestamp
            | ColumnType::DyNumber
            | ColumnType::Yson
            | ColumnType::List(_)
            | ColumnType::Struct(_) => false,
            ColumnType::Optional(inner) => inner.is_decodable(),
            _ => true,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => f.write_str("Bool"),
            ColumnType::Int8 => f.write_str("Int8"),
            ColumnType::Int16 => f.write_str("Int16"),
            ColumnType::Int32 => f.write_str("Int32"),
            ColumnType::Int64 => f.write_str("Int64"),
            ColumnType::Uint8 => f.write_str("Uint8"),
            ColumnType::Uint16 => f.write_str("Uint16"),
            ColumnType::Uint32 => f.write_str("Uint32"),
            ColumnType::Uint64 => f.write_str("Uint64"),
            ColumnType::Float => f.write_str("Float"),
            ColumnType::Double => f.write_str("Double"),
            ColumnType::Text => f.write_str("Text"),
            ColumnType::Bytes => f.write_str("Bytes"),
            ColumnType::Json => f.write_str("Json"),
            ColumnType::JsonDocument => f.write_str("JsonDocument"),
            ColumnType::Uuid => f.write_str("Uuid"),
            ColumnType::Date => f.write_str("Date"),
            ColumnType::Datetime => f.write_str("Datetime"),
            ColumnType::Timestamp => f.write_str("Timestamp"),
            ColumnType::Interval => f.write_str("Interval"),
            ColumnType::Decimal { precision, scale } => write!(f, "Decimal({precision}, {scale})"),
            ColumnType::TzDate => f.write_str("TzDate"),
            ColumnType::TzDatetime => f.write_str("TzDatetime"),
            ColumnType::TzTimestamp => f.write_str("TzTimestamp"),
            ColumnType::DyNumber => f.write_str("DyNumber"),
            ColumnType::Yson => f.write_str("Yson"),
            ColumnType::Optional(inner) => write!(f, "Optional<{inner}>"),
            ColumnType::List(item) => write!(f, "List<{item}>"),
            ColumnType::Struct(st) => write!(f, "{st}"),
        }
    }
}

/// Ordered named members of a `Struct<...>` type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StructType {
    members: Vec<(String, ColumnType)>,
}

impl StructType {
    /// Creates a struct type from `(name, type)` pairs.
    #[must_use]
    pub fn new(members: Vec<(String, ColumnType)>) -> Self {
        Self { members }
    }

    /// Returns the members in declaration order.
    #[must_use]
    pub fn members(&self) -> &[(String, ColumnType)] {
        &self.members
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the struct has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for StructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Struct<")?;
        for (i, (name, ty)) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "'{name}':{ty}")?;
        }
        f.write_str(">")
    }
}

/// A decoded value of some [`ColumnType`].
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// `Bool` value.
    Bool(bool),
    /// `Int8` value.
    Int8(i8),
    /// `Int16` value.
    Int16(i16),
    /// `Int32` value.
    Int32(i32),
    /// `Int64` value.
    Int64(i64),
    /// `Uint8` value.
    Uint8(u8),
    /// `Uint16` value.
    Uint16(u16),
    /// `Uint32` value.
    Uint32(u32),
    /// `Uint64` value.
    Uint64(u64),
    /// `Float` value.
    Float(f32),
    /// `Double` value.
    Double(f64),
    /// `Text` value.
    Text(String),
    /// `Bytes` value.
    Bytes(Vec<u8>),
    /// `Json` value as canonical text.
    Json(String),
    /// `JsonDocument` value as canonical text.
    JsonDocument(String),
    /// `Uuid` value.
    Uuid(Uuid),
    /// `Date` value.
    Date(NaiveDate),
    /// `Datetime` value, truncated to seconds.
    Datetime(NaiveDateTime),
    /// `Timestamp` value, truncated to microseconds.
    Timestamp(DateTime<Utc>),
    /// `Interval` value.
    Interval(TimeDelta),
    /// `Decimal` value, already scaled to the column's scale.
    Decimal(BigDecimal),
    /// `Optional<T>` value; `None` is the empty optional.
    Optional(Option<Box<TypedValue>>),
    /// `List<T>` value.
    List(Vec<TypedValue>),
    /// `Struct<...>` value, members in struct order.
    Struct(Vec<TypedValue>),
}

impl TypedValue {
    /// Wraps a value as a present optional.
    #[must_use]
    pub fn some(inner: TypedValue) -> Self {
        TypedValue::Optional(Some(Box::new(inner)))
    }

    /// The empty optional.
    #[must_use]
    pub fn none() -> Self {
        TypedValue::Optional(None)
    }
}
