//! User-facing mutations buffered by read-write transactions.

use meridian_types::{KeySet, Value};
use serde::{Deserialize, Serialize};

/// Mutation operation kinds, matching SQL upsert conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    /// Fails if a live row already exists at the key.
    Insert,
    /// Fails if no live row exists; unspecified columns keep their values.
    Update,
    /// Insert-or-update.
    InsertOrUpdate,
    /// Insert-or-overwrite; unspecified non-key columns become NULL.
    Replace,
    /// Delete the rows addressed by a key set.
    Delete,
}

/// One mutation against a named table. Row mutations carry a column list
/// and any number of value rows; deletes carry a key set instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    /// Operation kind.
    pub op: MutationOp,
    /// Target table name.
    pub table: String,
    /// Columns supplied by each row, for row mutations.
    pub columns: Vec<String>,
    /// Value rows, each aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
    /// Keys to delete, for delete mutations.
    pub key_set: KeySet,
}

impl Mutation {
    fn row_op(op: MutationOp, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Mutation {
            op,
            table: table.to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
            key_set: KeySet::default(),
        }
    }

    /// An insert of `rows`.
    pub fn insert(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::row_op(MutationOp::Insert, table, columns, rows)
    }

    /// An update of `rows`.
    pub fn update(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::row_op(MutationOp::Update, table, columns, rows)
    }

    /// An insert-or-update of `rows`.
    pub fn insert_or_update(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::row_op(MutationOp::InsertOrUpdate, table, columns, rows)
    }

    /// A replace of `rows`.
    pub fn replace(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::row_op(MutationOp::Replace, table, columns, rows)
    }

    /// A delete of every key in `key_set`.
    pub fn delete(table: &str, key_set: KeySet) -> Self {
        Mutation {
            op: MutationOp::Delete,
            table: table.to_owned(),
            columns: Vec::new(),
            rows: Vec::new(),
            key_set,
        }
    }
}
