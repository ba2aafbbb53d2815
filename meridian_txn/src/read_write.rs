//! Read-write transactions: buffered mutations with immediate constraint
//! surfacing, and the reserve / re-validate / apply / finalize commit path.

use crate::clock::Clock;
use crate::lock::{LockHandle, LockManager, TransactionKind};
use crate::mutation::{Mutation, MutationOp};
use crate::read_only::retag_key_set;
use meridian_index::{check_unique, index_effects, IndexChange, IndexOverlay};
use meridian_meta::{Schema, Table, VersionedCatalog};
use meridian_storage::{RowValues, Storage, WriteMutation, WriteOpKind};
use meridian_types::{
    Error, IndexId, Key, KeyPart, KeyRange, KeySet, Result, SortOrder, TableId, Timestamp,
    TransactionId, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Transaction lifecycle. `Committed` and `Aborted` are terminal and release
/// the lock handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting mutations.
    Open,
    /// Commit in progress with a reserved timestamp.
    Preparing,
    /// Writes are visible at the commit timestamp.
    Committed,
    /// Buffer discarded; nothing was written.
    Aborted,
}

/// A read-write transaction.
///
/// Every mutation is buffered in arrival order and validated immediately
/// against the latest schema and the effective (committed + buffered) state,
/// so schema and constraint violations surface before commit. The commit
/// path re-runs validation at the reserved timestamp, because both the
/// schema and the committed state may have moved since buffering.
pub struct ReadWriteTransaction {
    id: TransactionId,
    clock: Arc<Clock>,
    storage: Arc<dyn Storage>,
    catalog: Arc<VersionedCatalog>,
    handle: LockHandle,
    state: TransactionState,
    buffer: Vec<Mutation>,
    staged: Expansion,
}

impl ReadWriteTransaction {
    /// Begin a read-write transaction against the latest schema.
    pub fn begin(
        id: TransactionId,
        clock: Arc<Clock>,
        storage: Arc<dyn Storage>,
        lock_manager: &Arc<LockManager>,
        catalog: Arc<VersionedCatalog>,
    ) -> Result<Self> {
        let handle = lock_manager.create_handle(id, TransactionKind::ReadWrite, 1);
        let schema = catalog.latest_schema()?;
        let staged = Expansion::new(schema, clock.now());
        Ok(ReadWriteTransaction {
            id,
            clock,
            storage,
            catalog,
            handle,
            state: TransactionState::Open,
            buffer: Vec::new(),
            staged,
        })
    }

    /// This transaction's id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of buffered mutations.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer one mutation.
    ///
    /// The mutation is validated against the latest schema, expanded into
    /// its index effects, and checked for uniqueness against the combined
    /// committed-plus-buffered state. A schema or constraint error rejects
    /// only this mutation; the transaction stays open and usable.
    pub fn buffer_mutation(&mut self, mutation: Mutation) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(Error::FailedPrecondition(format!(
                "transaction {} is no longer open",
                self.id
            )));
        }
        // Validate against the freshest committed state available.
        self.staged.ts = self.clock.now();
        self.staged.apply(self.storage.as_ref(), &mutation)?;
        self.buffer.push(mutation);
        Ok(())
    }

    /// Commit: reserve a timestamp, re-validate the whole buffer at it,
    /// apply the expanded batch atomically, and publish the watermark.
    pub fn commit(mut self) -> Result<Timestamp> {
        if self.state != TransactionState::Open {
            return Err(Error::FailedPrecondition(format!(
                "transaction {} is no longer open",
                self.id
            )));
        }
        self.state = TransactionState::Preparing;
        let commit_ts = self.handle.reserve_commit_timestamp()?;
        match self.prepare_and_apply(commit_ts) {
            Ok(()) => {
                self.handle.finalize(true);
                self.state = TransactionState::Committed;
                info!(txn = %self.id, %commit_ts, mutations = self.buffer.len(), "committed");
                Ok(commit_ts)
            }
            Err(err) => {
                self.handle.finalize(false);
                self.state = TransactionState::Aborted;
                warn!(txn = %self.id, error = %err, "commit failed");
                Err(err)
            }
        }
    }

    /// Abort: discard the buffer and release the lock handle.
    pub fn abort(mut self) {
        self.handle.finalize(false);
        self.state = TransactionState::Aborted;
    }

    fn prepare_and_apply(&mut self, commit_ts: Timestamp) -> Result<()> {
        // Writers with smaller reserved timestamps must resolve before the
        // re-validation below, so it sees the final committed state under
        // our commit timestamp. Later reservations land above it.
        self.handle.wait_for_safe_read(commit_ts.prev())?;
        // DDL may have raced us; validate against the schema at commit time.
        let schema = self.catalog.get_schema(commit_ts)?;
        let mut expansion = Expansion::new(schema, commit_ts);
        for mutation in &self.buffer {
            expansion.apply(self.storage.as_ref(), mutation)?;
        }
        self.storage.write(commit_ts, &expansion.ops)
    }
}

/// Effective-state overlay shared by buffering and commit re-validation.
///
/// Applies user mutations one at a time on top of the committed state at
/// `ts`, accumulating the flattened storage batch in `ops` and tracking the
/// transaction's own view of base rows and index entries.
#[derive(Clone)]
pub(crate) struct Expansion {
    pub(crate) ts: Timestamp,
    schema: Arc<Schema>,
    base: HashMap<TableId, BTreeMap<Key, Option<RowValues>>>,
    indexes: HashMap<IndexId, IndexOverlay>,
    pub(crate) ops: Vec<WriteMutation>,
}

impl Expansion {
    pub(crate) fn new(schema: Arc<Schema>, ts: Timestamp) -> Self {
        Expansion {
            ts,
            schema,
            base: HashMap::new(),
            indexes: HashMap::new(),
            ops: Vec::new(),
        }
    }

    /// Apply one mutation atomically: either every row of the mutation
    /// lands in the overlay, or none does and the error is returned.
    pub(crate) fn apply(&mut self, storage: &dyn Storage, mutation: &Mutation) -> Result<()> {
        let mut scratch = self.clone();
        scratch.apply_inner(storage, mutation)?;
        *self = scratch;
        Ok(())
    }

    fn apply_inner(&mut self, storage: &dyn Storage, mutation: &Mutation) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let table = schema.table(&mutation.table)?;
        if mutation.op == MutationOp::Delete {
            return self.apply_delete(storage, &schema, table, &mutation.key_set);
        }

        let mut column_ids = Vec::with_capacity(mutation.columns.len());
        for name in &mutation.columns {
            column_ids.push(table.column(name)?.id);
        }
        for row in &mutation.rows {
            self.apply_row(storage, &schema, table, mutation.op, &column_ids, row)?;
        }
        Ok(())
    }

    fn apply_row(
        &mut self,
        storage: &dyn Storage,
        schema: &Schema,
        table: &Table,
        op: MutationOp,
        column_ids: &[meridian_types::ColumnId],
        row: &[Value],
    ) -> Result<()> {
        if row.len() != column_ids.len() {
            return Err(Error::InvalidArgument(format!(
                "mutation supplies {} columns but {} values",
                column_ids.len(),
                row.len()
            )));
        }
        let mut values = RowValues::new();
        for (&id, value) in column_ids.iter().zip(row) {
            let column = table.column_by_id(id)?;
            if !value.matches(column.ty) {
                return Err(Error::InvalidArgument(format!(
                    "column {} expects {:?}, got {value}",
                    column.name, column.ty
                )));
            }
            values.insert(id, value.clone());
        }

        let mut parts = Vec::with_capacity(table.primary_key.len());
        for kc in &table.primary_key {
            let name = &table.column_by_id(kc.column)?.name;
            match values.get(&kc.column) {
                Some(value) => parts.push(KeyPart {
                    value: value.clone(),
                    order: kc.order,
                }),
                None => {
                    return Err(Error::FailedPrecondition(format!(
                        "missing value for primary key column {name}"
                    )));
                }
            }
        }
        let key = Key::from_parts(parts);

        let old = self.effective_row(storage, table, &key)?;
        let new = match op {
            MutationOp::Insert => {
                if old.is_some() {
                    return Err(Error::AlreadyExists(format!(
                        "row {key} already exists in table {}",
                        table.name
                    )));
                }
                values.clone()
            }
            MutationOp::Update => match &old {
                Some(base) => {
                    let mut merged = base.clone();
                    merged.extend(values.iter().map(|(k, v)| (*k, v.clone())));
                    merged
                }
                None => {
                    return Err(Error::NotFound(format!(
                        "row {key} not found in table {}",
                        table.name
                    )));
                }
            },
            MutationOp::InsertOrUpdate => match &old {
                Some(base) => {
                    let mut merged = base.clone();
                    merged.extend(values.iter().map(|(k, v)| (*k, v.clone())));
                    merged
                }
                None => values.clone(),
            },
            MutationOp::Replace => values.clone(),
            MutationOp::Delete => {
                return Err(Error::Internal(
                    "delete mutations carry a key set, not rows".to_owned(),
                ));
            }
        };

        for column in &table.columns {
            if !column.nullable && new.get(&column.id).map_or(true, Value::is_null) {
                return Err(Error::FailedPrecondition(format!(
                    "cannot store NULL in non-nullable column {}",
                    column.name
                )));
            }
        }

        self.ops.push(WriteMutation {
            table: table.id,
            key: key.clone(),
            op: write_kind(op),
            values,
        });
        let changes = index_effects(schema, table, &key, old.as_ref(), Some(&new))?;
        self.apply_index_changes(storage, schema, changes)?;
        self.base.entry(table.id).or_default().insert(key, Some(new));
        Ok(())
    }

    fn apply_delete(
        &mut self,
        storage: &dyn Storage,
        schema: &Schema,
        table: &Table,
        key_set: &KeySet,
    ) -> Result<()> {
        let orders: Vec<SortOrder> = table.primary_key.iter().map(|kc| kc.order).collect();
        let mut keys: BTreeSet<Key> = BTreeSet::new();
        for point in &key_set.points {
            if point.len() != orders.len() {
                return Err(Error::InvalidArgument(format!(
                    "delete key {point} has {} parts, expected {}",
                    point.len(),
                    orders.len()
                )));
            }
            match point.with_orders(&orders) {
                Some(key) => keys.insert(key),
                None => unreachable!("arity checked above"),
            };
        }

        // Ranges address only rows that currently exist, committed or
        // buffered; point deletes tombstone unconditionally.
        let range_set = KeySet {
            points: Vec::new(),
            ranges: key_set.ranges.clone(),
            all: key_set.all,
        };
        let range_set = retag_key_set(&orders, &range_set)?;
        for range in range_set.canonicalize() {
            for stored in storage.read(self.ts, table.id, &range, &[])? {
                keys.insert(stored.key);
            }
            if let Some(overlay) = self.base.get(&table.id) {
                for (key, state) in overlay.range(range.bounds()) {
                    if state.is_some() {
                        keys.insert(key.clone());
                    }
                }
            }
        }

        for key in keys {
            let old = self.effective_row(storage, table, &key)?;
            self.ops.push(WriteMutation::delete(table.id, key.clone()));
            if old.is_some() {
                let changes = index_effects(schema, table, &key, old.as_ref(), None)?;
                self.apply_index_changes(storage, schema, changes)?;
            }
            self.base.entry(table.id).or_default().insert(key, None);
        }
        Ok(())
    }

    fn apply_index_changes(
        &mut self,
        storage: &dyn Storage,
        schema: &Schema,
        changes: Vec<IndexChange>,
    ) -> Result<()> {
        for change in changes {
            match change {
                IndexChange::Put {
                    index,
                    data_table,
                    key,
                    values,
                    fresh,
                } => {
                    if fresh {
                        let def = schema.index_by_id(index)?;
                        check_unique(storage, self.ts, def, &key, self.indexes.get(&index))?;
                    }
                    self.ops
                        .push(WriteMutation::insert_or_update(data_table, key.clone(), values.clone()));
                    self.indexes.entry(index).or_default().put(key, values);
                }
                IndexChange::Delete {
                    index,
                    data_table,
                    key,
                } => {
                    self.ops.push(WriteMutation::delete(data_table, key.clone()));
                    self.indexes.entry(index).or_default().delete(key);
                }
            }
        }
        Ok(())
    }

    /// The row's effective state: the transaction's own buffered version if
    /// any, otherwise the committed version at `ts`.
    fn effective_row(
        &self,
        storage: &dyn Storage,
        table: &Table,
        key: &Key,
    ) -> Result<Option<RowValues>> {
        if let Some(state) = self.base.get(&table.id).and_then(|t| t.get(key)) {
            return Ok(state.clone());
        }
        let column_ids = table.column_ids();
        let mut iter = storage.read(self.ts, table.id, &KeyRange::point(key.clone()), &column_ids)?;
        Ok(iter
            .next()
            .map(|stored| column_ids.into_iter().zip(stored.values).collect()))
    }
}

fn write_kind(op: MutationOp) -> WriteOpKind {
    match op {
        MutationOp::Insert => WriteOpKind::Insert,
        MutationOp::Update => WriteOpKind::Update,
        MutationOp::InsertOrUpdate => WriteOpKind::InsertOrUpdate,
        MutationOp::Replace => WriteOpKind::Replace,
        MutationOp::Delete => WriteOpKind::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FakeTimeSource, TimeSource};
    use meridian_meta::{ColumnDef, IndexDef, TableDef};
    use meridian_storage::MemoryStore;
    use meridian_types::{ErrorCode, Type};

    struct Fixture {
        clock: Arc<Clock>,
        storage: Arc<MemoryStore>,
        lock_manager: Arc<LockManager>,
        catalog: Arc<VersionedCatalog>,
        next_txn: std::cell::Cell<u64>,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(FakeTimeSource::new(Timestamp::from_micros(1_000)));
        let clock = Arc::new(Clock::new(source as Arc<dyn TimeSource>));
        let schema = Schema::builder()
            .table(
                TableDef::new("Users")
                    .column(ColumnDef::new("ID", Type::Int64).not_null())
                    .column(ColumnDef::new("Name", Type::String))
                    .column(ColumnDef::new("Age", Type::Int64))
                    .primary_key("ID"),
            )
            .index(IndexDef::new("UsersByName", "Users").column("Name"))
            .index(
                IndexDef::new("UsersByNameAgeUnique", "Users")
                    .column("Name")
                    .column("Age")
                    .unique(),
            )
            .build()
            .unwrap();
        Fixture {
            lock_manager: Arc::new(LockManager::new(Arc::clone(&clock))),
            clock,
            storage: Arc::new(MemoryStore::new()),
            catalog: Arc::new(VersionedCatalog::with_initial(schema)),
            next_txn: std::cell::Cell::new(1),
        }
    }

    impl Fixture {
        fn begin(&self) -> ReadWriteTransaction {
            let id = self.next_txn.get();
            self.next_txn.set(id + 1);
            ReadWriteTransaction::begin(
                TransactionId(id),
                Arc::clone(&self.clock),
                Arc::clone(&self.storage) as Arc<dyn Storage>,
                &self.lock_manager,
                Arc::clone(&self.catalog),
            )
            .unwrap()
        }

        fn insert_user(&self, id: i64, name: &str, age: i64) -> Timestamp {
            let mut txn = self.begin();
            txn.buffer_mutation(Mutation::insert(
                "Users",
                &["ID", "Name", "Age"],
                vec![vec![Value::Int64(id), Value::from(name), Value::Int64(age)]],
            ))
            .unwrap();
            txn.commit().unwrap()
        }
    }

    #[test]
    fn committed_insert_is_visible_at_its_timestamp() {
        let fx = fixture();
        let commit_ts = fx.insert_user(1, "Adam", 20);
        assert_eq!(fx.lock_manager.last_commit_timestamp(), commit_ts);

        let schema = fx.catalog.latest_schema().unwrap();
        let table = schema.table("Users").unwrap();
        assert!(fx
            .storage
            .is_key_present(commit_ts, table.id, &Key::new(vec![Value::Int64(1)])));
        assert!(!fx.storage.is_key_present(
            commit_ts.prev(),
            table.id,
            &Key::new(vec![Value::Int64(1)])
        ));
    }

    #[test]
    fn duplicate_insert_surfaces_at_buffer_time_and_txn_stays_usable() {
        let fx = fixture();
        fx.insert_user(1, "Adam", 20);

        let mut txn = fx.begin();
        let err = txn
            .buffer_mutation(Mutation::insert(
                "Users",
                &["ID", "Name", "Age"],
                vec![vec![Value::Int64(1), Value::from("Eve"), Value::Int64(30)]],
            ))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert_eq!(txn.buffered(), 0);
        assert_eq!(txn.state(), TransactionState::Open);

        // The transaction is still usable after the constraint error.
        txn.buffer_mutation(Mutation::insert(
            "Users",
            &["ID", "Name", "Age"],
            vec![vec![Value::Int64(2), Value::from("Eve"), Value::Int64(30)]],
        ))
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn update_of_missing_row_is_not_found() {
        let fx = fixture();
        let mut txn = fx.begin();
        let err = txn
            .buffer_mutation(Mutation::update(
                "Users",
                &["ID", "Name"],
                vec![vec![Value::Int64(9), Value::from("Nobody")]],
            ))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        txn.abort();
    }

    #[test]
    fn schema_violations_are_rejected() {
        let fx = fixture();
        let mut txn = fx.begin();
        // Unknown column.
        assert_eq!(
            txn.buffer_mutation(Mutation::insert(
                "Users",
                &["ID", "Ghost"],
                vec![vec![Value::Int64(1), Value::Null]],
            ))
            .unwrap_err()
            .code(),
            ErrorCode::NotFound
        );
        // Type mismatch.
        assert_eq!(
            txn.buffer_mutation(Mutation::insert(
                "Users",
                &["ID", "Name"],
                vec![vec![Value::Int64(1), Value::Int64(7)]],
            ))
            .unwrap_err()
            .code(),
            ErrorCode::InvalidArgument
        );
        // NULL into a NOT NULL primary-key column.
        assert_eq!(
            txn.buffer_mutation(Mutation::insert(
                "Users",
                &["ID", "Name"],
                vec![vec![Value::Null, Value::from("Adam")]],
            ))
            .unwrap_err()
            .code(),
            ErrorCode::FailedPrecondition
        );
        // Missing primary-key column.
        assert_eq!(
            txn.buffer_mutation(Mutation::insert(
                "Users",
                &["Name"],
                vec![vec![Value::from("Adam")]],
            ))
            .unwrap_err()
            .code(),
            ErrorCode::FailedPrecondition
        );
        txn.abort();
    }

    #[test]
    fn intra_transaction_unique_violation_surfaces_immediately() {
        let fx = fixture();
        let mut txn = fx.begin();
        // Both rows leave (Name, Age) implicitly NULL, so they collide in
        // the non-null-filtered unique index.
        txn.buffer_mutation(Mutation::insert_or_update(
            "Users",
            &["ID"],
            vec![vec![Value::Int64(0)]],
        ))
        .unwrap();
        let err = txn
            .buffer_mutation(Mutation::insert(
                "Users",
                &["ID"],
                vec![vec![Value::Int64(1)]],
            ))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        txn.abort();
    }

    #[test]
    fn commit_revalidation_catches_racing_writer() {
        let fx = fixture();
        let mut txn1 = fx.begin();
        let mut txn2 = fx.begin();
        let row = vec![vec![Value::Int64(1), Value::from("Adam"), Value::Int64(20)]];
        txn1.buffer_mutation(Mutation::insert("Users", &["ID", "Name", "Age"], row.clone()))
            .unwrap();
        // txn2 buffers the same insert before txn1 commits, so buffering
        // succeeds; the conflict must surface at commit.
        txn2.buffer_mutation(Mutation::insert("Users", &["ID", "Name", "Age"], row))
            .unwrap();
        txn1.commit().unwrap();
        let err = txn2.commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let fx = fixture();
        let mut txn = fx.begin();
        txn.buffer_mutation(Mutation::insert(
            "Users",
            &["ID", "Name", "Age"],
            vec![vec![Value::Int64(1), Value::from("Adam"), Value::Int64(20)]],
        ))
        .unwrap();
        txn.abort();

        let schema = fx.catalog.latest_schema().unwrap();
        let table = schema.table("Users").unwrap();
        assert!(!fx.storage.is_key_present(
            fx.clock.now() + std::time::Duration::from_secs(1),
            table.id,
            &Key::new(vec![Value::Int64(1)])
        ));
    }

    #[test]
    fn delete_by_range_removes_buffered_and_committed_rows() {
        let fx = fixture();
        fx.insert_user(1, "Adam", 20);
        fx.insert_user(2, "John", 22);

        let mut txn = fx.begin();
        txn.buffer_mutation(Mutation::insert(
            "Users",
            &["ID", "Name", "Age"],
            vec![vec![Value::Int64(3), Value::from("Peter"), Value::Int64(41)]],
        ))
        .unwrap();
        txn.buffer_mutation(Mutation::delete(
            "Users",
            KeySet::range(KeyRange::closed(
                Key::new(vec![Value::Int64(1)]),
                Key::new(vec![Value::Int64(3)]),
            )),
        ))
        .unwrap();
        let commit_ts = txn.commit().unwrap();

        let schema = fx.catalog.latest_schema().unwrap();
        let table = schema.table("Users").unwrap();
        for id in 1..=3 {
            assert!(!fx.storage.is_key_present(
                commit_ts,
                table.id,
                &Key::new(vec![Value::Int64(id)])
            ));
        }
    }

    #[test]
    fn commit_is_atomic_across_base_and_index_tables() {
        let fx = fixture();
        let commit_ts = fx.insert_user(1, "Adam", 20);
        let schema = fx.catalog.latest_schema().unwrap();
        let index = schema.index("UsersByName").unwrap();
        let rows: Vec<_> = fx
            .storage
            .read(commit_ts, index.data_table, &KeyRange::all(), &[])
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        // Nothing in the index keyspace before the commit timestamp.
        let rows: Vec<_> = fx
            .storage
            .read(commit_ts.prev(), index.data_table, &KeyRange::all(), &[])
            .unwrap()
            .collect();
        assert!(rows.is_empty());
    }
}
