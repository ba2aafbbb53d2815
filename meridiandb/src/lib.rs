//! MeridianDB: an in-process emulator of a globally-distributed relational
//! database. This crate wires the transactional storage core together — the
//! monotonic clock, the versioned store, the lock manager and the versioned
//! schema catalog — and exposes transactions, DDL and maintenance on a
//! single [`Database`] value.

pub use meridian_meta::{ColumnDef, IndexDef, Schema, SchemaBuilder, TableDef, VersionedCatalog};
pub use meridian_txn::{
    Clock, FakeTimeSource, LockManager, Mutation, MutationOp, ReadArg, ReadOnlyOptions,
    ReadOnlyTransaction, ReadWriteTransaction, Row, RowCursor, SystemTimeSource, TimeSource,
    TimestampBound, TransactionKind, TransactionState,
};
pub use meridian_types::{
    Error, ErrorCode, Key, KeyRange, KeySet, SortOrder, Timestamp, TransactionId, Type, Value,
};

use meridian_index::{check_unique, entry_key, entry_values, IndexOverlay};
use meridian_storage::{MemoryStore, RowValues, Storage, WriteMutation};
use meridian_types::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Tunables of the emulator core.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// How long row versions are retained. Snapshot reads older than this
    /// fail with `OutOfRange`, and [`Database::run_gc`] prunes up to it.
    pub version_gc_horizon: Duration,
    /// Seed for the randomised staleness bounds. `None` seeds from entropy;
    /// tests pin it for determinism.
    pub rng_seed: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            version_gc_horizon: Duration::from_secs(3600),
            rng_seed: None,
        }
    }
}

/// A single in-memory database: storage, lock manager, clock and catalog,
/// shared by every transaction begun through it.
pub struct Database {
    config: DatabaseConfig,
    clock: Arc<Clock>,
    storage: Arc<MemoryStore>,
    lock_manager: Arc<LockManager>,
    catalog: Arc<VersionedCatalog>,
    rng: Mutex<StdRng>,
    next_txn_id: AtomicU64,
}

impl Database {
    /// A database over the system clock with default configuration.
    pub fn new(schema: Schema) -> Self {
        Database::with_clock(schema, DatabaseConfig::default(), Arc::new(Clock::system()))
    }

    /// A database over an explicit clock; tests inject a fake time source.
    pub fn with_clock(schema: Schema, config: DatabaseConfig, clock: Arc<Clock>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Database {
            config,
            lock_manager: Arc::new(LockManager::new(Arc::clone(&clock))),
            clock,
            storage: Arc::new(MemoryStore::new()),
            catalog: Arc::new(VersionedCatalog::with_initial(schema)),
            rng: Mutex::new(rng),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// The shared clock.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The shared lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// The newest schema snapshot.
    pub fn latest_schema(&self) -> Result<Arc<Schema>> {
        self.catalog.latest_schema()
    }

    /// The watermark of the most recent successful commit.
    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.lock_manager.last_commit_timestamp()
    }

    fn next_txn(&self) -> TransactionId {
        TransactionId(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Begin a read-only transaction with the given timestamp bound.
    pub fn begin_read_only(&self, options: ReadOnlyOptions) -> Result<ReadOnlyTransaction> {
        // Fork a per-transaction rng so the master lock is not held across
        // the safe-read wait.
        let mut rng = {
            let mut master = self.rng.lock().unwrap();
            StdRng::seed_from_u64(master.gen())
        };
        ReadOnlyTransaction::begin(
            &options,
            self.next_txn(),
            Arc::clone(&self.clock),
            Arc::clone(&self.storage) as Arc<dyn Storage>,
            &self.lock_manager,
            &self.catalog,
            &mut rng,
            self.config.version_gc_horizon,
        )
    }

    /// Begin a read-write transaction.
    pub fn begin_read_write(&self) -> Result<ReadWriteTransaction> {
        ReadWriteTransaction::begin(
            self.next_txn(),
            Arc::clone(&self.clock),
            Arc::clone(&self.storage) as Arc<dyn Storage>,
            &self.lock_manager,
            Arc::clone(&self.catalog),
        )
    }

    /// Buffer `mutations` into a fresh read-write transaction and commit.
    /// The first mutation to fail aborts the transaction and becomes the
    /// result, so the batch is all-or-nothing.
    pub fn write(&self, mutations: Vec<Mutation>) -> Result<Timestamp> {
        let mut txn = self.begin_read_write()?;
        for mutation in mutations {
            if let Err(err) = txn.buffer_mutation(mutation) {
                txn.abort();
                return Err(err);
            }
        }
        txn.commit()
    }

    /// Strong read convenience: a single-use read-only transaction.
    pub fn read(&self, arg: &ReadArg) -> Result<RowCursor> {
        self.begin_read_only(ReadOnlyOptions::strong())?.read(arg)
    }

    /// Apply a schema change as a schema-change transaction.
    ///
    /// The new schema becomes authoritative at the DDL commit timestamp.
    /// Indexes that did not exist in the previous schema are backfilled from
    /// the base table at that same timestamp, enforcing null-filtering and
    /// uniqueness; a unique index over duplicate existing data fails the
    /// whole schema change with `AlreadyExists` and installs nothing.
    pub fn update_schema(&self, builder: SchemaBuilder) -> Result<Timestamp> {
        let schema = builder.build()?;
        let mut handle =
            self.lock_manager
                .create_handle(self.next_txn(), TransactionKind::SchemaChange, 1);
        let commit_ts = match handle.reserve_commit_timestamp() {
            Ok(ts) => ts,
            Err(err) => {
                handle.finalize(false);
                return Err(err);
            }
        };
        match self.backfill_and_install(&handle, commit_ts, schema) {
            Ok(()) => {
                handle.finalize(true);
                info!(%commit_ts, "schema change committed");
                Ok(commit_ts)
            }
            Err(err) => {
                handle.finalize(false);
                Err(err)
            }
        }
    }

    fn backfill_and_install(
        &self,
        handle: &meridian_txn::LockHandle,
        commit_ts: Timestamp,
        schema: Schema,
    ) -> Result<()> {
        // Let in-flight writers below our timestamp resolve so the backfill
        // scan sees the final committed state.
        handle.wait_for_safe_read(commit_ts.prev())?;
        let previous = self.catalog.latest_schema()?;
        let mut ops: Vec<WriteMutation> = Vec::new();
        for index in schema.indexes() {
            if previous.index(&index.name).is_ok() {
                continue;
            }
            let table = schema.table_by_id(index.base_table)?;
            let column_ids = table.column_ids();
            let mut overlay = IndexOverlay::new();
            for stored in self
                .storage
                .read(commit_ts, table.id, &KeyRange::all(), &column_ids)?
            {
                let row: RowValues = column_ids.iter().copied().zip(stored.values).collect();
                if let Some(entry) = entry_key(index, table, &stored.key, &row) {
                    check_unique(
                        self.storage.as_ref(),
                        commit_ts,
                        index,
                        &entry,
                        Some(&overlay),
                    )?;
                    let values = entry_values(index, table, &stored.key, &row);
                    ops.push(WriteMutation::insert_or_update(
                        index.data_table,
                        entry.clone(),
                        values.clone(),
                    ));
                    overlay.put(entry, values);
                }
            }
        }
        if !ops.is_empty() {
            self.storage.write(commit_ts, &ops)?;
        }
        self.catalog.install(commit_ts, schema)
    }

    /// Drop row versions older than the configured GC horizon.
    pub fn run_gc(&self) {
        let horizon = self.clock.now().saturating_sub(self.config.version_gc_horizon);
        self.storage.gc_versions_older_than(horizon);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("last_commit", &self.last_commit_timestamp())
            .finish()
    }
}
