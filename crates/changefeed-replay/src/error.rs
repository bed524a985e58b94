//! Error types for the replay pipeline.
//!
//! Errors are split by how far they propagate:
//! - [`BindError`]: a change stream cannot be created; other streams keep running
//! - [`DecodeError`]: a partition writer cannot continue and stops
//! - [`ReplayError`]: top-level error for configuration and lifecycle operations
//!
//! Write failures are deliberately absent: a failed write is a
//! [`Status`](crate::database::Status) value that the writer retries.

use thiserror::Error;

use crate::database::Status;

/// Errors raised while turning a JSON value into a typed value.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The column type has no JSON decoding (timezone variants, `DyNumber`, ...).
    #[error("unsupported column type: {ty}")]
    UnsupportedType {
        /// Rendered column type.
        ty: String,
    },

    /// The JSON node does not have the shape the column type requires.
    #[error("can't read value {value} as {ty}: {reason}")]
    MalformedValue {
        /// Rendered column type.
        ty: String,
        /// The offending JSON text.
        value: String,
        /// Details about the failure.
        reason: String,
    },

    /// A non-optional column has no value in the change event.
    #[error("missing value for non-optional column '{column}' of type {ty}")]
    MissingValue {
        /// Column name.
        column: String,
        /// Rendered column type.
        ty: String,
    },

    /// The message payload is not valid JSON.
    #[error("JSON error: {0}")]
    Json(String),
}

impl DecodeError {
    pub(crate) fn malformed(
        ty: impl ToString,
        value: &serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        DecodeError::MalformedValue {
            ty: ty.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e.to_string())
    }
}

/// Errors raised while binding a change stream to its destination queries.
#[derive(Debug, Error)]
pub enum BindError {
    /// The stream configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The table behind the changefeed could not be described.
    #[error("can't describe table {path}: {status}")]
    SchemaUnavailable {
        /// Table path.
        path: String,
        /// Status returned by the database.
        status: Status,
    },

    /// A named query reference does not exist in the query library.
    #[error("query '{0}' is not defined")]
    QueryNotFound(String),

    /// The database rejected the query text.
    #[error("can't parse query: {status}")]
    QueryParse {
        /// Status returned by the database.
        status: Status,
    },

    /// A delete query reads a column that is not part of the primary key.
    #[error("delete query uses non-key column '{column}'")]
    KeyOnlyViolation {
        /// The non-key column.
        column: String,
    },

    /// The query declares zero or several parameters.
    #[error("expected only one parameter, but got [{}]", names.join(","))]
    ParameterCount {
        /// Declared parameter names.
        names: Vec<String>,
    },

    /// The single parameter is not a `List<Struct<...>>`.
    #[error("expected type List<Struct<...>>, but got {ty}")]
    ParameterShape {
        /// Rendered parameter type.
        ty: String,
    },

    /// A row member does not exist in the source table.
    #[error("source table doesn't have column {column}")]
    UnknownColumn {
        /// The unknown column.
        column: String,
    },

    /// A row member is typed differently from the table column.
    #[error("source table column {column} has type {actual} instead of {expected}")]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Type declared by the query.
        expected: String,
        /// Type declared by the table.
        actual: String,
    },

    /// The query library names an action outside insert/upsert/update/delete.
    #[error("unknown query action '{0}'")]
    UnknownAction(String),

    /// A row member uses a type the codec cannot decode.
    #[error("column {column} has unsupported type {ty}")]
    UnsupportedType {
        /// Column name.
        column: String,
        /// Rendered column type.
        ty: String,
    },
}

/// Top-level error for replay operations.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Stream binding failed.
    #[error("bind error: {0}")]
    Bind(#[from] BindError),

    /// Change event decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// The subscription source failed.
    #[error("subscription error: {0}")]
    Subscription(String),
}
