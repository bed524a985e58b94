//! Pending rows of one destination query.
//!
//! A [`Batch`] belongs to a single writer and a single [`QueryBinding`].
//! Rows are decoded once on arrival; a failed execute leaves the rows in
//! place so the retry sends exactly the same parameter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::binding::{QueryBinding, RowSchema};
use crate::codec;
use crate::database::{Database, QueryParams, Status};
use crate::envelope::ChangeEvent;
use crate::error::DecodeError;
use crate::types::TypedValue;

/// Buffered rows bound to one query.
#[derive(Debug)]
pub struct Batch {
    binding: Arc<QueryBinding>,
    rows: Vec<TypedValue>,
    // Discard bindings count events instead of decoding them.
    discarded: usize,
    newest_created_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Creates an empty batch for a binding.
    #[must_use]
    pub fn new(binding: Arc<QueryBinding>) -> Self {
        let capacity = if binding.is_discard() {
            0
        } else {
            binding.batch_limit
        };
        Self {
            binding,
            rows: Vec::with_capacity(capacity),
            discarded: 0,
            newest_created_at: None,
        }
    }

    /// The binding this batch writes through.
    #[must_use]
    pub fn binding(&self) -> &Arc<QueryBinding> {
        &self.binding
    }

    /// Decodes an event and appends it as a row.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if a member can't be decoded; the batch is
    /// left unchanged.
    pub fn add_row(&mut self, event: &ChangeEvent) -> Result<(), DecodeError> {
        if self.binding.is_discard() {
            self.discarded += 1;
        } else {
            let row = decode_row(&self.binding.row, event)?;
            self.rows.push(row);
        }
        self.newest_created_at = Some(match self.newest_created_at {
            Some(newest) => newest.max(event.created_at),
            None => event.created_at,
        });
        Ok(())
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len() + self.discarded
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the batch limit is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.binding.batch_limit
    }

    /// Creation time of the newest buffered event.
    #[must_use]
    pub fn newest_created_at(&self) -> Option<DateTime<Utc>> {
        self.newest_created_at
    }

    /// Drops all buffered rows.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.discarded = 0;
        self.newest_created_at = None;
    }

    /// Renders the rows as the query's list parameter.
    #[must_use]
    pub fn params(&self) -> QueryParams {
        QueryParams {
            name: self.binding.param_name.clone(),
            ty: self.binding.param_type(),
            value: TypedValue::List(self.rows.clone()),
        }
    }

    /// Writes the batch with one statement.
    ///
    /// The rows are kept; the caller clears the batch after a success.
    pub async fn execute(&self, db: &dyn Database) -> Status {
        match self.binding.action.query() {
            Some(query) => {
                db.execute_query(query, &self.params(), self.binding.timeout)
                    .await
            }
            None => {
                info!(
                    events = self.discarded,
                    kind = %self.binding.kind,
                    "skipped events because no query is configured"
                );
                Status::SUCCESS
            }
        }
    }
}

/// Decodes one event into a row struct.
///
/// Key members come from the event key, the rest from the payload.
fn decode_row(row: &RowSchema, event: &ChangeEvent) -> Result<TypedValue, DecodeError> {
    let mut values = Vec::with_capacity(row.members().len());
    for member in row.members() {
        let node = match member.key_index {
            Some(index) => event.key_value(index),
            None => event.column_value(&member.name),
        };
        if node.map_or(true, serde_json::Value::is_null) && !member.ty.is_optional() {
            return Err(DecodeError::MissingValue {
                column: member.name.clone(),
                ty: member.ty.to_string(),
            });
        }
        values.push(codec::decode(node, &member.ty)?);
    }
    Ok(TypedValue::Struct(values))
}
