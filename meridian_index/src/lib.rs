//! Secondary-index maintenance.
//!
//! Derives index-entry mutations from base-row mutations: builds entry keys
//! honouring per-column sort direction, applies the null-filter rule, fans an
//! indexed-column update out into delete-old + insert-new, and checks
//! uniqueness against both committed state and a transaction's own buffered
//! entries.

use meridian_meta::{Index, Schema, Table};
use meridian_storage::{RowValues, Storage};
use meridian_types::{Error, IndexId, Key, KeyPart, KeyRange, Result, TableId, Timestamp, Value};
use std::collections::BTreeMap;

/// One derived change to an index's entries.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexChange {
    /// Write (or rewrite) the entry at `key`.
    Put {
        /// The index owning the entry.
        index: IndexId,
        /// Keyspace holding the index entries.
        data_table: TableId,
        /// Full entry key (indexed columns plus primary-key tie-break).
        key: Key,
        /// Entry payload: indexed, key and stored column values.
        values: RowValues,
        /// Whether this creates an entry at a key the row did not occupy
        /// before; only fresh entries need a uniqueness check.
        fresh: bool,
    },
    /// Remove the entry at `key`.
    Delete {
        /// The index owning the entry.
        index: IndexId,
        /// Keyspace holding the index entries.
        data_table: TableId,
        /// Full entry key.
        key: Key,
    },
}

/// The full entry key for `row` under `index`, or `None` when the row is
/// filtered out by the index's null-filter rule.
///
/// The key starts with the indexed columns in declared order and direction,
/// then appends the base primary-key parts not already present so that two
/// rows with equal indexed values still produce distinct entry keys.
pub fn entry_key(index: &Index, table: &Table, row_key: &Key, row: &RowValues) -> Option<Key> {
    let mut parts = Vec::with_capacity(index.key_columns.len() + table.primary_key.len());
    for kc in &index.key_columns {
        let value = row.get(&kc.column).cloned().unwrap_or(Value::Null);
        if index.null_filtered && value.is_null() {
            return None;
        }
        parts.push(KeyPart {
            value,
            order: kc.order,
        });
    }
    for (pos, pk) in table.primary_key.iter().enumerate() {
        if !index.has_key_column(pk.column) {
            parts.push(KeyPart {
                value: row_key.value(pos).clone(),
                order: pk.order,
            });
        }
    }
    Some(Key::from_parts(parts))
}

/// The payload stored with an index entry: the indexed columns, the base
/// primary-key columns and the index's stored (covering) columns.
pub fn entry_values(index: &Index, table: &Table, row_key: &Key, row: &RowValues) -> RowValues {
    let mut values = BTreeMap::new();
    for kc in &index.key_columns {
        values.insert(kc.column, row.get(&kc.column).cloned().unwrap_or(Value::Null));
    }
    for (pos, pk) in table.primary_key.iter().enumerate() {
        values.insert(pk.column, row_key.value(pos).clone());
    }
    for &column in &index.stored_columns {
        values.insert(column, row.get(&column).cloned().unwrap_or(Value::Null));
    }
    values
}

/// Derive the index changes implied by one base-row transition on `table`.
///
/// `old_row` and `new_row` are the row's column values before and after the
/// mutation (`None` meaning absent). A transition that leaves the entry key
/// and payload untouched produces no change for that index.
pub fn index_effects(
    schema: &Schema,
    table: &Table,
    row_key: &Key,
    old_row: Option<&RowValues>,
    new_row: Option<&RowValues>,
) -> Result<Vec<IndexChange>> {
    let mut changes = Vec::new();
    for index in schema.indexes_of(table.id) {
        let old_key = old_row.and_then(|row| entry_key(index, table, row_key, row));
        let new_entry = new_row.map(|row| {
            (
                entry_key(index, table, row_key, row),
                entry_values(index, table, row_key, row),
            )
        });
        match (old_key, new_entry) {
            (None, None) | (None, Some((None, _))) => {}
            (Some(key), None) | (Some(key), Some((None, _))) => {
                changes.push(IndexChange::Delete {
                    index: index.id,
                    data_table: index.data_table,
                    key,
                });
            }
            (None, Some((Some(key), values))) => {
                changes.push(IndexChange::Put {
                    index: index.id,
                    data_table: index.data_table,
                    key,
                    values,
                    fresh: true,
                });
            }
            (Some(old_key), Some((Some(new_key), values))) => {
                if old_key == new_key {
                    let unchanged = old_row
                        .map(|row| entry_values(index, table, row_key, row) == values)
                        .unwrap_or(false);
                    if !unchanged {
                        changes.push(IndexChange::Put {
                            index: index.id,
                            data_table: index.data_table,
                            key: new_key,
                            values,
                            fresh: false,
                        });
                    }
                } else {
                    changes.push(IndexChange::Delete {
                        index: index.id,
                        data_table: index.data_table,
                        key: old_key,
                    });
                    changes.push(IndexChange::Put {
                        index: index.id,
                        data_table: index.data_table,
                        key: new_key,
                        values,
                        fresh: true,
                    });
                }
            }
        }
    }
    Ok(changes)
}

/// A transaction's buffered view of one index's entries: keys it has added
/// (live payload) or removed (`None`) ahead of commit.
#[derive(Debug, Clone, Default)]
pub struct IndexOverlay {
    entries: BTreeMap<Key, Option<RowValues>>,
}

impl IndexOverlay {
    /// An empty overlay.
    pub fn new() -> Self {
        IndexOverlay::default()
    }

    /// Record a buffered entry write.
    pub fn put(&mut self, key: Key, values: RowValues) {
        self.entries.insert(key, Some(values));
    }

    /// Record a buffered entry delete.
    pub fn delete(&mut self, key: Key) {
        self.entries.insert(key, None);
    }

    /// The buffered state of `key`: `None` if untouched, `Some(None)` if
    /// deleted, `Some(Some(_))` if written.
    pub fn get(&self, key: &Key) -> Option<&Option<RowValues>> {
        self.entries.get(key)
    }

    /// Buffered live entries inside `range`, in key order.
    pub fn live_in_range<'a>(
        &'a self,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a Key, &'a RowValues)> + 'a {
        self.entries
            .range(range.bounds())
            .filter_map(|(key, state)| state.as_ref().map(|values| (key, values)))
    }
}

/// Enforce uniqueness for `candidate` under a unique `index`.
///
/// Another live entry with the same indexed-column prefix — committed at
/// `ts` and not deleted in the buffer, or added by the buffer — fails with
/// `AlreadyExists`. Entries sharing the candidate's full key are the same
/// base row and do not conflict. Non-unique indexes always pass.
pub fn check_unique(
    storage: &dyn Storage,
    ts: Timestamp,
    index: &Index,
    candidate: &Key,
    overlay: Option<&IndexOverlay>,
) -> Result<()> {
    if !index.unique {
        return Ok(());
    }
    let prefix = candidate.prefix(index.key_columns.len());
    let range = KeyRange::prefix(prefix.clone());

    if let Some(overlay) = overlay {
        for (key, _) in overlay.live_in_range(&range) {
            if key != candidate {
                return Err(duplicate(index, &prefix));
            }
        }
    }
    for row in storage.read(ts, index.data_table, &range, &[])? {
        if &row.key == candidate {
            continue;
        }
        // Entries superseded in the buffer no longer count as committed.
        if overlay.and_then(|o| o.get(&row.key)).is_some() {
            continue;
        }
        return Err(duplicate(index, &prefix));
    }
    Ok(())
}

fn duplicate(index: &Index, prefix: &Key) -> Error {
    Error::AlreadyExists(format!(
        "unique index {} already contains key {}",
        index.name, prefix
    ))
}
