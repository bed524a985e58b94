//! Schema binding of change streams to destination queries.
//!
//! [`bind_stream`] runs once per configured stream at startup. It resolves the
//! changefeed's source table, picks the update and delete queries, checks
//! their row parameter against the table schema and produces an immutable
//! [`StreamBinding`] shared by every writer of the stream.
//!
//! A query can be run as written, or wrapped into a DML statement against an
//! action table:
//!
//! | Action       | Statement                                         |
//! |--------------|---------------------------------------------------|
//! | `insertInto` | ``INSERT INTO `T` <fragment>``                    |
//! | `upsertInto` | ``UPSERT INTO `T` <fragment>``                    |
//! | `updateOn`   | ``UPDATE `T` ON <fragment>``                      |
//! | `deleteFrom` | ``DELETE FROM `T` ON SELECT <keys> FROM (<fragment>)`` |
//!
//! Leading `DECLARE` statements of the fragment stay in front of the result.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{ChangeStreamConfig, NamedQuery, QuerySource};
use crate::database::{Database, TableDescription};
use crate::error::BindError;
use crate::types::{ColumnType, StructType};

// ── Actions ──

/// DML statement kind synthesized around a query fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlAction {
    /// `INSERT INTO`.
    InsertInto,
    /// `UPSERT INTO`.
    UpsertInto,
    /// `UPDATE ... ON`.
    UpdateOn,
    /// `DELETE FROM ... ON`.
    DeleteFrom,
}

impl DmlAction {
    /// Wraps `fragment` into a full statement against `table`.
    ///
    /// `keys` is the action table's primary key, used by `deleteFrom`.
    #[must_use]
    pub fn render(self, table: &str, keys: &[String], fragment: &str) -> String {
        let (declares, body) = split_declares(fragment);
        let body = body.trim().trim_end_matches(';').trim_end();
        let statement = match self {
            DmlAction::InsertInto => format!("INSERT INTO `{table}` {body}"),
            DmlAction::UpsertInto => format!("UPSERT INTO `{table}` {body}"),
            DmlAction::UpdateOn => format!("UPDATE `{table}` ON {body}"),
            DmlAction::DeleteFrom => {
                let key_list: Vec<String> = keys.iter().map(|k| format!("`{k}`")).collect();
                format!(
                    "DELETE FROM `{table}` ON SELECT {} FROM ({body})",
                    key_list.join(", ")
                )
            }
        };
        if declares.is_empty() {
            statement
        } else {
            format!("{declares}\n{statement}")
        }
    }
}

impl FromStr for DmlAction {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "insertInto" => Ok(DmlAction::InsertInto),
            "upsertInto" => Ok(DmlAction::UpsertInto),
            "updateOn" => Ok(DmlAction::UpdateOn),
            "deleteFrom" => Ok(DmlAction::DeleteFrom),
            other => Err(BindError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for DmlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DmlAction::InsertInto => "insertInto",
            DmlAction::UpsertInto => "upsertInto",
            DmlAction::UpdateOn => "updateOn",
            DmlAction::DeleteFrom => "deleteFrom",
        };
        f.write_str(name)
    }
}

/// Splits leading `DECLARE ...;` statements off a query fragment.
fn split_declares(fragment: &str) -> (String, &str) {
    let mut declares: Vec<&str> = Vec::new();
    let mut rest = fragment;
    loop {
        let trimmed = rest.trim_start();
        let is_declare = trimmed
            .get(..8)
            .is_some_and(|head| head.eq_ignore_ascii_case("DECLARE "));
        if !is_declare {
            break;
        }
        let Some(end) = trimmed.find(';') else {
            break;
        };
        declares.push(&trimmed[..=end]);
        rest = &trimmed[end + 1..];
    }
    (declares.join("\n"), rest)
}

/// What a binding does with a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingAction {
    /// Run the configured query with the batch as its parameter.
    Execute {
        /// Statement text.
        query: String,
    },
    /// Run a statement synthesized around the configured fragment.
    Dml {
        /// Statement kind.
        action: DmlAction,
        /// Full path of the action table.
        table: String,
        /// Rendered statement text.
        query: String,
        /// Primary key of the action table.
        key_columns: Vec<String>,
    },
    /// No query configured: count matching events and drop them.
    Discard,
}

impl BindingAction {
    /// Statement to execute, `None` for [`BindingAction::Discard`].
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        match self {
            BindingAction::Execute { query } | BindingAction::Dml { query, .. } => Some(query),
            BindingAction::Discard => None,
        }
    }
}

// ── Row schema ──

/// One member of the row struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMember {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: ColumnType,
    /// Position in the event key, for primary key columns.
    pub key_index: Option<usize>,
}

/// Row struct of a query parameter, annotated with key positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSchema {
    members: Vec<RowMember>,
}

impl RowSchema {
    /// Creates a row schema from members in struct order.
    #[must_use]
    pub fn new(members: Vec<RowMember>) -> Self {
        Self { members }
    }

    /// Returns the members in struct order.
    #[must_use]
    pub fn members(&self) -> &[RowMember] {
        &self.members
    }

    /// The struct type of one row.
    #[must_use]
    pub fn struct_type(&self) -> StructType {
        StructType::new(
            self.members
                .iter()
                .map(|m| (m.name.clone(), m.ty.clone()))
                .collect(),
        )
    }
}

// ── Bindings ──

/// Which events a binding receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Update events.
    Update,
    /// Erase events.
    Erase,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Update => f.write_str("update"),
            EventKind::Erase => f.write_str("erase"),
        }
    }
}

/// A resolved, schema-checked destination query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBinding {
    /// Events routed to this binding.
    pub kind: EventKind,
    /// Parameter name including the `$` sigil; empty for discard.
    pub param_name: String,
    /// Row struct of the parameter.
    pub row: RowSchema,
    /// Rows per write.
    pub batch_limit: usize,
    /// What to do with a flushed batch.
    pub action: BindingAction,
    /// Per-call timeout.
    pub timeout: Option<Duration>,
}

impl QueryBinding {
    /// A binding that drops every event routed to it.
    #[must_use]
    pub fn discard(kind: EventKind, batch_limit: usize) -> Self {
        Self {
            kind,
            param_name: String::new(),
            row: RowSchema::default(),
            batch_limit,
            action: BindingAction::Discard,
            timeout: None,
        }
    }

    /// Returns `true` for discard bindings.
    #[must_use]
    pub fn is_discard(&self) -> bool {
        self.action == BindingAction::Discard
    }

    /// Parameter type: `List<Struct<...>>` of the row.
    #[must_use]
    pub fn param_type(&self) -> ColumnType {
        ColumnType::list(ColumnType::Struct(self.row.struct_type()))
    }
}

/// Update and delete bindings of one change stream.
#[derive(Debug, Clone)]
pub struct StreamBinding {
    /// Full changefeed path.
    pub changefeed: String,
    /// Full path of the source table.
    pub table: String,
    /// Binding for update events.
    pub update: Arc<QueryBinding>,
    /// Binding for erase events.
    pub delete: Arc<QueryBinding>,
}

// ── Binder ──

struct ResolvedQuery<'a> {
    text: &'a str,
    action: Option<(DmlAction, &'a str)>,
}

fn resolve<'a>(
    source: QuerySource<'a>,
    queries: &'a [NamedQuery],
) -> Result<Option<ResolvedQuery<'a>>, BindError> {
    match source {
        QuerySource::None => Ok(None),
        QuerySource::Inline(text) => Ok(Some(ResolvedQuery { text, action: None })),
        QuerySource::Named(id) => {
            let query = queries
                .iter()
                .find(|q| q.id == id)
                .ok_or_else(|| BindError::QueryNotFound(id.to_string()))?;
            let action = match (query.action.as_deref(), query.table.as_deref()) {
                (Some(action), Some(table)) => Some((action.parse()?, table)),
                (Some(action), None) => {
                    return Err(BindError::Config(format!(
                        "query '{id}' has action {action} but no table"
                    )));
                }
                (None, _) => None,
            };
            Ok(Some(ResolvedQuery {
                text: &query.text,
                action,
            }))
        }
    }
}

/// Returns the table path owning a changefeed path.
///
/// # Errors
///
/// Returns `BindError::Config` if the path has no table segment.
pub fn table_path(changefeed: &str) -> Result<&str, BindError> {
    match changefeed.rfind('/') {
        Some(index) if index > 0 => Ok(&changefeed[..index]),
        _ => Err(BindError::Config(format!(
            "changefeed name has to contain table name with /: {changefeed}"
        ))),
    }
}

async fn describe(db: &dyn Database, path: &str) -> Result<TableDescription, BindError> {
    db.describe_table(path)
        .await
        .map_err(|status| BindError::SchemaUnavailable {
            path: path.to_string(),
            status,
        })
}

/// Parses a query and returns its single `List<Struct<...>>` parameter.
async fn row_parameter(db: &dyn Database, text: &str) -> Result<(String, StructType), BindError> {
    let mut types = db
        .parse_query(text)
        .await
        .map_err(|status| BindError::QueryParse { status })?;

    if types.len() != 1 {
        return Err(BindError::ParameterCount {
            names: types.into_iter().map(|(name, _)| name).collect(),
        });
    }
    let Some((name, ty)) = types.pop() else {
        return Err(BindError::ParameterCount { names: Vec::new() });
    };

    if let ColumnType::List(item) = &ty {
        if let ColumnType::Struct(row) = item.as_ref() {
            return Ok((name, row.clone()));
        }
    }
    Err(BindError::ParameterShape { ty: ty.to_string() })
}

/// Checks every row member against the source table.
fn check_row(row: &StructType, table: &TableDescription) -> Result<RowSchema, BindError> {
    let mut members = Vec::with_capacity(row.len());
    for (name, ty) in row.members() {
        let column = table.column(name).ok_or_else(|| BindError::UnknownColumn {
            column: name.clone(),
        })?;
        if &column.ty != ty {
            return Err(BindError::TypeMismatch {
                column: name.clone(),
                expected: ty.to_string(),
                actual: column.ty.to_string(),
            });
        }
        if !ty.is_decodable() {
            return Err(BindError::UnsupportedType {
                column: name.clone(),
                ty: ty.to_string(),
            });
        }
        members.push(RowMember {
            name: name.clone(),
            ty: ty.clone(),
            key_index: table.key_index(name),
        });
    }
    Ok(RowSchema::new(members))
}

async fn bind_query(
    db: &dyn Database,
    kind: EventKind,
    source: QuerySource<'_>,
    queries: &[NamedQuery],
    table: &TableDescription,
    config: &ChangeStreamConfig,
) -> Result<QueryBinding, BindError> {
    let Some(resolved) = resolve(source, queries)? else {
        debug!(consumer = %config.consumer, %kind, "no query configured, events will be discarded");
        return Ok(QueryBinding::discard(kind, config.batch_size));
    };

    let (param_name, row) = row_parameter(db, resolved.text).await?;
    let row = check_row(&row, table)?;

    if kind == EventKind::Erase {
        if let Some(member) = row.members().iter().find(|m| m.key_index.is_none()) {
            return Err(BindError::KeyOnlyViolation {
                column: member.name.clone(),
            });
        }
    }

    let action = match resolved.action {
        None => BindingAction::Execute {
            query: resolved.text.to_string(),
        },
        Some((action, target)) => {
            let target = db.expand_path(target);
            let target_desc = describe(db, &target).await?;
            let query = action.render(&target, &target_desc.primary_keys, resolved.text);
            BindingAction::Dml {
                action,
                table: target,
                query,
                key_columns: target_desc.primary_keys,
            }
        }
    };

    Ok(QueryBinding {
        kind,
        param_name,
        row,
        batch_limit: config.batch_size,
        action,
        timeout: config.timeout(),
    })
}

/// Binds a change stream to its update and delete queries.
///
/// # Errors
///
/// Returns the first [`BindError`] found; the stream must not be created.
pub async fn bind_stream(
    db: &dyn Database,
    config: &ChangeStreamConfig,
    queries: &[NamedQuery],
) -> Result<StreamBinding, BindError> {
    let changefeed = db.expand_path(&config.changefeed);
    let table_path = table_path(&changefeed)?.to_string();
    let table = describe(db, &table_path).await?;

    let update = bind_query(db, EventKind::Update, config.update_source(), queries, &table, config).await?;
    let delete = bind_query(db, EventKind::Erase, config.delete_source(), queries, &table, config).await?;

    info!(
        changefeed = %changefeed,
        consumer = %config.consumer,
        update_param = %update.param_name,
        delete_param = %delete.param_name,
        "change stream bound"
    );

    Ok(StreamBinding {
        changefeed,
        table: table_path,
        update: Arc::new(update),
        delete: Arc::new(delete),
    })
}
