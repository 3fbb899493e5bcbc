//! Translation of one change event into one idempotent write.
//!
//! Row values are never spliced into SQL: the row image is bound as a single JSONB
//! parameter and projected onto the table's row type with `jsonb_populate_record`,
//! so the target table's column types drive the conversion. Only validated, quoted
//! identifiers appear in statement text.

use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

use super::models::{ChangeEvent, Identifier, Operation, RowImage};
use super::store::ApplyTransaction;
use crate::error::{ReplicatorError, Result};
use crate::metrics;

/// Possibly schema-qualified target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<Identifier>,
    pub name: Identifier,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema.quoted(), self.name.quoted()),
            None => f.write_str(&self.name.quoted()),
        }
    }
}

/// Why an event produces no write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Tombstone,
    /// Create/update without an `after` image
    EmptyRow,
    UnknownOperation(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Tombstone => metrics::SKIP_TOMBSTONE,
            SkipReason::EmptyRow => metrics::SKIP_EMPTY_ROW,
            SkipReason::UnknownOperation(_) => metrics::SKIP_UNKNOWN_OP,
        }
    }
}

/// The single write an event translates to
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert the row; on key conflict overwrite every non-key column
    Upsert {
        table: TableRef,
        key_column: Identifier,
        columns: Vec<Identifier>,
        row: RowImage,
    },
    /// Delete the row with this key
    Delete {
        table: TableRef,
        key_column: Identifier,
        key: Value,
    },
    Skip(SkipReason),
}

/// SQL text plus its single JSONB parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub row: Value,
}

impl Statement {
    /// Render a mutation; `None` for skips
    pub fn for_mutation(mutation: &Mutation) -> Option<Self> {
        match mutation {
            Mutation::Upsert {
                table,
                key_column,
                columns,
                row,
            } => {
                let column_list = columns
                    .iter()
                    .map(Identifier::quoted)
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = columns
                    .iter()
                    .filter(|c| *c != key_column)
                    .map(|c| format!("{0} = EXCLUDED.{0}", c.quoted()))
                    .collect::<Vec<_>>();
                let conflict_action = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", updates.join(", "))
                };

                Some(Statement {
                    sql: format!(
                        "INSERT INTO {table} ({columns}) \
                         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
                         ON CONFLICT ({key}) {action}",
                        table = table,
                        columns = column_list,
                        key = key_column.quoted(),
                        action = conflict_action,
                    ),
                    row: Value::Object(row.clone()),
                })
            }
            Mutation::Delete {
                table,
                key_column,
                key,
            } => {
                let mut row = Map::new();
                row.insert(key_column.as_str().to_string(), key.clone());

                Some(Statement {
                    sql: format!(
                        "DELETE FROM {table} WHERE {key} = \
                         (SELECT {key} FROM jsonb_populate_record(NULL::{table}, $1::jsonb))",
                        table = table,
                        key = key_column.quoted(),
                    ),
                    row: Value::Object(row),
                })
            }
            Mutation::Skip(_) => None,
        }
    }
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write ran; rows affected
    Written(u64),
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct MutationApplier {
    primary_key: Identifier,
    schema: Option<Identifier>,
}

impl MutationApplier {
    pub fn new(primary_key: Identifier, schema: Option<Identifier>) -> Self {
        Self {
            primary_key,
            schema,
        }
    }

    /// Pure translation of an event into its mutation.
    ///
    /// Errors are per-event: a missing key on a delete (or on a non-empty upsert
    /// image), an invalid table or column name.
    pub fn plan(&self, event: &ChangeEvent) -> Result<Mutation> {
        match &event.operation {
            Operation::Tombstone => {
                debug!(
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    "Tombstone, nothing to apply"
                );
                Ok(Mutation::Skip(SkipReason::Tombstone))
            }
            Operation::Unknown(code) => {
                warn!(
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    op = %code,
                    "Unknown operation code, skipping"
                );
                Ok(Mutation::Skip(SkipReason::UnknownOperation(code.clone())))
            }
            Operation::Create | Operation::Snapshot | Operation::Update => {
                let row = match &event.after {
                    Some(row) if !row.is_empty() => row,
                    _ => {
                        warn!(
                            topic = %event.topic,
                            partition = event.partition,
                            offset = event.offset,
                            op = ?event.operation,
                            "Empty `after` image, skipping"
                        );
                        return Ok(Mutation::Skip(SkipReason::EmptyRow));
                    }
                };
                self.key_value(event, row, "after")?;

                let mut columns = row
                    .keys()
                    .map(|name| Identifier::parse(name))
                    .collect::<Result<Vec<_>>>()?;
                columns.sort();

                Ok(Mutation::Upsert {
                    table: self.table(event)?,
                    key_column: self.primary_key.clone(),
                    columns,
                    row: row.clone(),
                })
            }
            Operation::Delete => {
                let key = match &event.before {
                    Some(before) => self.key_value(event, before, "before")?,
                    None => return Err(self.missing_key(event, "before")),
                };

                Ok(Mutation::Delete {
                    table: self.table(event)?,
                    key_column: self.primary_key.clone(),
                    key,
                })
            }
        }
    }

    /// Translate and execute one event inside the caller's transaction
    pub async fn apply(
        &self,
        tx: &mut dyn ApplyTransaction,
        event: &ChangeEvent,
    ) -> Result<ApplyOutcome> {
        match self.plan(event)? {
            Mutation::Skip(reason) => Ok(ApplyOutcome::Skipped(reason)),
            mutation => {
                let rows = tx.execute(&mutation).await?;
                debug!(
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    table = %event.stream,
                    rows,
                    "Mutation applied"
                );
                Ok(ApplyOutcome::Written(rows))
            }
        }
    }

    /// A schema named by the topic wins over the configured one
    fn table(&self, event: &ChangeEvent) -> Result<TableRef> {
        let schema = match &event.stream_schema {
            Some(schema) => Some(Identifier::parse(schema)?),
            None => self.schema.clone(),
        };
        Ok(TableRef {
            schema,
            name: Identifier::parse(&event.stream)?,
        })
    }

    fn key_value(&self, event: &ChangeEvent, row: &RowImage, image: &'static str) -> Result<Value> {
        match row.get(self.primary_key.as_str()) {
            Some(Value::Null) | None => Err(self.missing_key(event, image)),
            Some(value) => Ok(value.clone()),
        }
    }

    fn missing_key(&self, event: &ChangeEvent, image: &'static str) -> ReplicatorError {
        ReplicatorError::MissingPrimaryKey {
            table: event.stream.clone(),
            column: self.primary_key.to_string(),
            image,
        }
    }
}
