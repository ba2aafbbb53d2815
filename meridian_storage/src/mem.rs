//! In-memory multi-version store.

use crate::{RowIter, RowValues, StoredRow, Storage, WriteMutation, WriteOpKind};
use meridian_types::{ColumnId, Error, Key, KeyRange, Result, TableId, Timestamp, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// One version of a row: either live column values or a tombstone.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Live(RowValues),
    Tombstone,
}

/// All versions of one key, newest resolved by range lookup.
#[derive(Debug, Default)]
struct VersionChain {
    versions: BTreeMap<Timestamp, Cell>,
}

impl VersionChain {
    fn visible_at(&self, ts: Timestamp) -> Option<&Cell> {
        self.versions.range(..=ts).next_back().map(|(_, cell)| cell)
    }

    fn live_at(&self, ts: Timestamp) -> Option<&RowValues> {
        match self.visible_at(ts) {
            Some(Cell::Live(values)) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct TableVersions {
    rows: BTreeMap<Key, VersionChain>,
}

/// The in-memory versioned store. Reads share a read lock and never block
/// each other; a write batch takes the write lock for the duration of its
/// validate-and-apply section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<TableId, TableVersions>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn project(key: &Key, values: &RowValues, columns: &[ColumnId]) -> StoredRow {
        StoredRow {
            key: key.clone(),
            values: columns
                .iter()
                .map(|id| values.get(id).cloned().unwrap_or(Value::Null))
                .collect(),
        }
    }
}

impl Storage for MemoryStore {
    fn read(
        &self,
        ts: Timestamp,
        table: TableId,
        range: &KeyRange,
        columns: &[ColumnId],
    ) -> Result<RowIter> {
        if range.is_empty() {
            return Ok(RowIter::new(Vec::new()));
        }
        let guard = self.tables.read().unwrap();
        let rows = match guard.get(&table) {
            Some(versions) => versions
                .rows
                .range(range.bounds())
                .filter_map(|(key, chain)| {
                    chain.live_at(ts).map(|values| Self::project(key, values, columns))
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(RowIter::new(rows))
    }

    fn write(&self, commit_ts: Timestamp, mutations: &[WriteMutation]) -> Result<()> {
        let mut guard = self.tables.write().unwrap();

        // Validate every mutation against the batch-effective state before
        // touching any chain, so the first offending mutation fails the
        // whole batch with nothing applied.
        let mut effective: BTreeMap<(TableId, Key), Cell> = BTreeMap::new();
        for m in mutations {
            let current = effective
                .get(&(m.table, m.key.clone()))
                .cloned()
                .or_else(|| {
                    guard
                        .get(&m.table)
                        .and_then(|t| t.rows.get(&m.key))
                        .and_then(|chain| chain.visible_at(commit_ts))
                        .cloned()
                });
            let live = matches!(current, Some(Cell::Live(_)));
            let next = match m.op {
                WriteOpKind::Insert => {
                    if live {
                        return Err(Error::AlreadyExists(format!(
                            "row {} already exists in {}",
                            m.key, m.table
                        )));
                    }
                    Cell::Live(m.values.clone())
                }
                WriteOpKind::Update => match current {
                    Some(Cell::Live(mut old)) => {
                        old.extend(m.values.iter().map(|(k, v)| (*k, v.clone())));
                        Cell::Live(old)
                    }
                    _ => {
                        return Err(Error::NotFound(format!(
                            "row {} not found in {}",
                            m.key, m.table
                        )));
                    }
                },
                WriteOpKind::InsertOrUpdate => match current {
                    Some(Cell::Live(mut old)) => {
                        old.extend(m.values.iter().map(|(k, v)| (*k, v.clone())));
                        Cell::Live(old)
                    }
                    _ => Cell::Live(m.values.clone()),
                },
                WriteOpKind::Replace => Cell::Live(m.values.clone()),
                WriteOpKind::Delete => Cell::Tombstone,
            };
            effective.insert((m.table, m.key.clone()), next);
        }

        for ((table, key), cell) in effective {
            guard
                .entry(table)
                .or_default()
                .rows
                .entry(key)
                .or_default()
                .versions
                .insert(commit_ts, cell);
        }
        Ok(())
    }

    fn is_key_present(&self, ts: Timestamp, table: TableId, key: &Key) -> bool {
        let guard = self.tables.read().unwrap();
        guard
            .get(&table)
            .and_then(|t| t.rows.get(key))
            .and_then(|chain| chain.live_at(ts))
            .is_some()
    }

    fn gc_versions_older_than(&self, ts: Timestamp) {
        let mut guard = self.tables.write().unwrap();
        let mut pruned = 0usize;
        for table in guard.values_mut() {
            table.rows.retain(|_, chain| {
                // Keep everything newer than the horizon plus, if it is
                // live, the newest version at or before it. A tombstone at
                // the horizon hides all older versions, so the whole prefix
                // can go.
                let keep_floor = match chain.versions.range(..=ts).next_back() {
                    Some((&version_ts, Cell::Live(_))) => Some(version_ts),
                    Some((_, Cell::Tombstone)) => None,
                    None => return true,
                };
                let before = chain.versions.len();
                match keep_floor {
                    Some(floor) => chain.versions.retain(|&vts, _| vts >= floor),
                    None => chain.versions.retain(|&vts, _| vts > ts),
                }
                pruned += before - chain.versions.len();
                !chain.versions.is_empty()
            });
        }
        guard.retain(|_, table| !table.rows.is_empty());
        if pruned > 0 {
            debug!(%ts, pruned, "garbage collected row versions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::ErrorCode;

    const TABLE: TableId = TableId(1);
    const COL_A: ColumnId = ColumnId(10);
    const COL_B: ColumnId = ColumnId(11);

    fn key(v: i64) -> Key {
        Key::new(vec![Value::Int64(v)])
    }

    fn ts(v: i64) -> Timestamp {
        Timestamp::from_micros(v)
    }

    fn row(a: i64, b: &str) -> RowValues {
        let mut values = RowValues::new();
        values.insert(COL_A, Value::Int64(a));
        values.insert(COL_B, Value::from(b));
        values
    }

    fn read_all(store: &MemoryStore, at: Timestamp) -> Vec<StoredRow> {
        store
            .read(at, TABLE, &KeyRange::all(), &[COL_A, COL_B])
            .unwrap()
            .collect()
    }

    #[test]
    fn read_sees_newest_version_at_or_before_timestamp() {
        let store = MemoryStore::new();
        store
            .write(ts(10), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        store
            .write(ts(20), &[WriteMutation::update(TABLE, key(1), row(1, "b"))])
            .unwrap();

        assert!(read_all(&store, ts(9)).is_empty());
        assert_eq!(read_all(&store, ts(10))[0].values[1], Value::from("a"));
        assert_eq!(read_all(&store, ts(15))[0].values[1], Value::from("a"));
        assert_eq!(read_all(&store, ts(20))[0].values[1], Value::from("b"));
    }

    #[test]
    fn insert_fails_on_live_row() {
        let store = MemoryStore::new();
        store
            .write(ts(10), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        let err = store
            .write(ts(20), &[WriteMutation::insert(TABLE, key(1), row(1, "b"))])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        // Insert after a delete succeeds again.
        store
            .write(ts(30), &[WriteMutation::delete(TABLE, key(1))])
            .unwrap();
        store
            .write(ts(40), &[WriteMutation::insert(TABLE, key(1), row(1, "c"))])
            .unwrap();
    }

    #[test]
    fn update_requires_live_row_and_merges() {
        let store = MemoryStore::new();
        let err = store
            .write(ts(10), &[WriteMutation::update(TABLE, key(1), row(1, "a"))])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        store
            .write(ts(20), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        let mut partial = RowValues::new();
        partial.insert(COL_B, Value::from("b"));
        store
            .write(
                ts(30),
                &[WriteMutation {
                    table: TABLE,
                    key: key(1),
                    op: WriteOpKind::Update,
                    values: partial,
                }],
            )
            .unwrap();
        let rows = read_all(&store, ts(30));
        assert_eq!(rows[0].values, vec![Value::Int64(1), Value::from("b")]);
    }

    #[test]
    fn replace_clears_unspecified_columns() {
        let store = MemoryStore::new();
        store
            .write(ts(10), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        let mut only_a = RowValues::new();
        only_a.insert(COL_A, Value::Int64(1));
        store
            .write(ts(20), &[WriteMutation::replace(TABLE, key(1), only_a)])
            .unwrap();
        let rows = read_all(&store, ts(20));
        assert_eq!(rows[0].values, vec![Value::Int64(1), Value::Null]);
    }

    #[test]
    fn delete_is_idempotent_and_writes_a_tombstone() {
        let store = MemoryStore::new();
        store
            .write(ts(10), &[WriteMutation::delete(TABLE, key(1))])
            .unwrap();
        store
            .write(ts(20), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        store
            .write(ts(30), &[WriteMutation::delete(TABLE, key(1))])
            .unwrap();

        assert!(store.is_key_present(ts(20), TABLE, &key(1)));
        assert!(!store.is_key_present(ts(30), TABLE, &key(1)));
        assert!(read_all(&store, ts(30)).is_empty());
        // The old version is still visible at its own timestamp.
        assert_eq!(read_all(&store, ts(25)).len(), 1);
    }

    #[test]
    fn batch_is_atomic_and_first_error_wins() {
        let store = MemoryStore::new();
        let err = store
            .write(
                ts(10),
                &[
                    WriteMutation::insert(TABLE, key(1), row(1, "a")),
                    WriteMutation::update(TABLE, key(2), row(2, "b")),
                ],
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        // Nothing from the failed batch landed.
        assert!(read_all(&store, ts(10)).is_empty());
    }

    #[test]
    fn batch_sees_its_own_earlier_mutations() {
        let store = MemoryStore::new();
        store
            .write(
                ts(10),
                &[
                    WriteMutation::insert(TABLE, key(1), row(1, "a")),
                    WriteMutation::update(TABLE, key(1), row(1, "b")),
                ],
            )
            .unwrap();
        assert_eq!(read_all(&store, ts(10))[0].values[1], Value::from("b"));

        // Delete then insert within one batch ends live.
        store
            .write(
                ts(20),
                &[
                    WriteMutation::delete(TABLE, key(1)),
                    WriteMutation::insert(TABLE, key(1), row(1, "c")),
                ],
            )
            .unwrap();
        assert_eq!(read_all(&store, ts(20))[0].values[1], Value::from("c"));
    }

    #[test]
    fn rows_come_back_in_key_order() {
        let store = MemoryStore::new();
        store
            .write(
                ts(10),
                &[
                    WriteMutation::insert(TABLE, key(5), row(5, "e")),
                    WriteMutation::insert(TABLE, key(1), row(1, "a")),
                    WriteMutation::insert(TABLE, key(3), row(3, "c")),
                ],
            )
            .unwrap();
        let keys: Vec<Key> = read_all(&store, ts(10)).into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![key(1), key(3), key(5)]);
    }

    #[test]
    fn range_read_respects_bounds() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .write(
                    ts(10 + i),
                    &[WriteMutation::insert(TABLE, key(i), row(i, "x"))],
                )
                .unwrap();
        }
        let range = KeyRange::from_flags(key(1), key(3), true, false);
        let rows: Vec<StoredRow> = store.read(ts(50), TABLE, &range, &[COL_A]).unwrap().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, key(1));
        assert_eq!(rows[1].key, key(2));
    }

    #[test]
    fn gc_drops_superseded_and_tombstoned_versions() {
        let store = MemoryStore::new();
        store
            .write(ts(10), &[WriteMutation::insert(TABLE, key(1), row(1, "a"))])
            .unwrap();
        store
            .write(ts(20), &[WriteMutation::update(TABLE, key(1), row(1, "b"))])
            .unwrap();
        store
            .write(ts(10), &[WriteMutation::insert(TABLE, key(2), row(2, "a"))])
            .unwrap();
        store
            .write(ts(20), &[WriteMutation::delete(TABLE, key(2))])
            .unwrap();

        store.gc_versions_older_than(ts(30));

        // Key 1 keeps only its newest live version, still readable.
        assert_eq!(read_all(&store, ts(30))[0].values[1], Value::from("b"));
        // Key 2's chain was fully collected.
        assert!(!store.is_key_present(ts(30), TABLE, &key(2)));
        // Versions behind the horizon are gone.
        assert!(read_all(&store, ts(10)).is_empty());
    }
}
