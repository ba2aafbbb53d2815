//! Versioned key/value storage substrate.
//!
//! Storage retains multiple versions per key; a read at timestamp `ts`
//! observes the newest version at or before `ts`, and a delete is a
//! tombstone version that hides earlier ones. The [`Storage`] trait is the
//! plugin contract; [`MemoryStore`] is the in-process implementation.
#![deny(missing_docs)]

use meridian_types::{ColumnId, Key, Result, TableId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod mem;

pub use mem::MemoryStore;

/// Column values of one row version, keyed by column id. A column absent
/// from the map reads as NULL.
pub type RowValues = BTreeMap<ColumnId, Value>;

/// The write operation kinds, matching SQL upsert conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOpKind {
    /// Fail with `AlreadyExists` if a live row exists at the key.
    Insert,
    /// Fail with `NotFound` if no live row exists; merges into the old row.
    Update,
    /// Insert or, if the row exists, merge like an update.
    InsertOrUpdate,
    /// Insert or overwrite; unspecified non-key columns become NULL.
    Replace,
    /// Write a tombstone. Deleting an absent key is not an error.
    Delete,
}

/// One mutation inside an atomic write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteMutation {
    /// Target keyspace (a base table or an index data table).
    pub table: TableId,
    /// Full row or entry key.
    pub key: Key,
    /// Operation kind.
    pub op: WriteOpKind,
    /// Column values carried by the mutation. Ignored for deletes.
    pub values: RowValues,
}

impl WriteMutation {
    /// An insert mutation.
    pub fn insert(table: TableId, key: Key, values: RowValues) -> Self {
        WriteMutation {
            table,
            key,
            op: WriteOpKind::Insert,
            values,
        }
    }

    /// An update mutation.
    pub fn update(table: TableId, key: Key, values: RowValues) -> Self {
        WriteMutation {
            table,
            key,
            op: WriteOpKind::Update,
            values,
        }
    }

    /// An insert-or-update mutation.
    pub fn insert_or_update(table: TableId, key: Key, values: RowValues) -> Self {
        WriteMutation {
            table,
            key,
            op: WriteOpKind::InsertOrUpdate,
            values,
        }
    }

    /// A replace mutation.
    pub fn replace(table: TableId, key: Key, values: RowValues) -> Self {
        WriteMutation {
            table,
            key,
            op: WriteOpKind::Replace,
            values,
        }
    }

    /// A delete mutation.
    pub fn delete(table: TableId, key: Key) -> Self {
        WriteMutation {
            table,
            key,
            op: WriteOpKind::Delete,
            values: RowValues::new(),
        }
    }
}

/// One row produced by a versioned read, with values aligned to the
/// requested column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// The row key.
    pub key: Key,
    /// Values in the order of the requested columns; NULL when unset.
    pub values: Vec<Value>,
}

/// Owning iterator over the rows of one key range, in key order.
#[derive(Debug)]
pub struct RowIter {
    rows: std::vec::IntoIter<StoredRow>,
}

impl RowIter {
    /// Wrap an already-collected row list.
    pub fn new(rows: Vec<StoredRow>) -> Self {
        RowIter {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for RowIter {
    type Item = StoredRow;

    fn next(&mut self) -> Option<StoredRow> {
        self.rows.next()
    }
}

/// Plugin contract for the versioned storage substrate.
pub trait Storage: Send + Sync {
    /// Rows in `range` of `table` whose newest version at or before `ts` is
    /// live, in key order, projected onto `columns`.
    fn read(
        &self,
        ts: Timestamp,
        table: TableId,
        range: &meridian_types::KeyRange,
        columns: &[ColumnId],
    ) -> Result<RowIter>;

    /// Apply a batch atomically at `commit_ts`. Mutations are validated in
    /// insertion order against the batch-effective state; the first
    /// offending mutation fails the whole batch and nothing is applied.
    fn write(&self, commit_ts: Timestamp, mutations: &[WriteMutation]) -> Result<()>;

    /// Whether a live row exists at `key` as of `ts`.
    fn is_key_present(&self, ts: Timestamp, table: TableId, key: &Key) -> bool;

    /// Drop versions that no read at or after `ts` can observe.
    fn gc_versions_older_than(&self, ts: Timestamp);
}
