//! Target database contract.
//!
//! The pipeline talks to the database only through [`Database`]: schema
//! discovery at bind time and one parameterized statement per flushed batch.
//! Session management, TLS and the wire protocol live behind the trait.
//! None of the methods retry; retrying is the writer's job.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ColumnType, TypedValue};

/// Outcome class of a database call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The call succeeded.
    Success,
    /// The request was rejected as invalid.
    BadRequest,
    /// A scheme object is missing or has the wrong shape.
    SchemeError,
    /// The database is temporarily unavailable.
    Unavailable,
    /// The database is overloaded.
    Overloaded,
    /// The call did not finish within its timeout.
    Timeout,
    /// The transaction was aborted (e.g. lock conflict).
    Aborted,
    /// The transport to the database failed.
    TransportUnavailable,
    /// The client side failed before or after the call.
    ClientInternalError,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::SchemeError => "SCHEME_ERROR",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Overloaded => "OVERLOADED",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::Aborted => "ABORTED",
            StatusCode::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            StatusCode::ClientInternalError => "CLIENT_INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Result of a database call: a code plus optional issue text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Outcome class.
    pub code: StatusCode,
    /// Human-readable issues reported with the status.
    pub message: Option<String>,
}

impl Status {
    /// The success status.
    pub const SUCCESS: Status = Status {
        code: StatusCode::Success,
        message: None,
    };

    /// Creates a failure status.
    #[must_use]
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Returns `true` if the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "Status{{code = {}, issues = [{msg}]}}", self.code),
            None => write!(f, "Status{{code = {}}}", self.code),
        }
    }
}

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Declared column type.
    pub ty: ColumnType,
}

impl TableColumn {
    /// Creates a column descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Columns and primary key of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableDescription {
    /// Columns in table order.
    pub columns: Vec<TableColumn>,
    /// Primary key column names in key order.
    pub primary_keys: Vec<String>,
}

impl TableDescription {
    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the key-order index of a primary key column.
    #[must_use]
    pub fn key_index(&self, name: &str) -> Option<usize> {
        self.primary_keys.iter().position(|k| k == name)
    }
}

/// Declared parameters of a parsed query, in declaration order.
pub type QueryTypes = Vec<(String, ColumnType)>;

/// The single list-valued parameter of a batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    /// Parameter name including its `$` sigil.
    pub name: String,
    /// Parameter type (always `List<Struct<...>>`).
    pub ty: ColumnType,
    /// Parameter value.
    pub value: TypedValue,
}

/// Database accessor used for binding and batch execution.
#[async_trait]
pub trait Database: Send + Sync {
    /// Database root path used to expand relative changefeed paths.
    fn database(&self) -> &str;

    /// Fetches the column list and primary key order of a table.
    ///
    /// # Errors
    ///
    /// Returns the failing status on transport or describe failure.
    async fn describe_table(&self, path: &str) -> Result<TableDescription, Status>;

    /// Infers the declared parameter types of a query without running it.
    ///
    /// # Errors
    ///
    /// Returns the failing status if the query does not compile.
    async fn parse_query(&self, query: &str) -> Result<QueryTypes, Status>;

    /// Executes a write statement with one parameter.
    async fn execute_query(
        &self,
        query: &str,
        params: &QueryParams,
        timeout: Option<Duration>,
    ) -> Status;

    /// Expands a relative path against [`database`](Self::database).
    fn expand_path(&self, name: &str) -> String {
        expand_path(self.database(), name)
    }
}

/// Prefixes a relative object path with the database root.
///
/// Absolute and empty paths are returned unchanged, as is everything when
/// the database root is empty.
#[must_use]
pub fn expand_path(database: &str, name: &str) -> String {
    if database.is_empty() || name.is_empty() || name.starts_with('/') {
        return name.to_string();
    }
    let mut path = String::with_capacity(database.len() + name.len() + 2);
    if !database.starts_with('/') {
        path.push('/');
    }
    path.push_str(database);
    if !database.ends_with('/') {
        path.push('/');
    }
    path.push_str(name);
    path
}
