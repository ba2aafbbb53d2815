//! Read-only transactions: snapshot reads at a fixed timestamp.

use crate::clock::Clock;
use crate::cursor::RowCursor;
use crate::lock::{LockHandle, LockManager, TransactionKind};
use crate::options::{ReadArg, ReadOnlyOptions, TimestampBound};
use meridian_meta::{Schema, VersionedCatalog};
use meridian_storage::Storage;
use meridian_types::{
    ColumnId, Error, Key, KeyRange, KeySet, Result, SortOrder, TableId, Timestamp, TransactionId,
};
use rand::Rng;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// A read-only transaction pinned to one read timestamp and one schema.
///
/// Construction picks the timestamp per the requested bound, waits until
/// reads at that timestamp are safe (no preparing writer may still commit at
/// or before it) and pins the schema that was authoritative at that instant.
/// The timestamp is immutable for the transaction's life.
pub struct ReadOnlyTransaction {
    id: TransactionId,
    read_timestamp: Timestamp,
    schema: Arc<Schema>,
    storage: Arc<dyn Storage>,
    clock: Arc<Clock>,
    gc_horizon: Duration,
    _handle: LockHandle,
}

impl ReadOnlyTransaction {
    /// Begin a read-only transaction. Blocks at two points: a future exact
    /// timestamp waits for the clock to catch up, and the safe-read wait
    /// covers writers preparing at or before the chosen timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn begin<R: Rng>(
        options: &ReadOnlyOptions,
        id: TransactionId,
        clock: Arc<Clock>,
        storage: Arc<dyn Storage>,
        lock_manager: &Arc<LockManager>,
        catalog: &VersionedCatalog,
        rng: &mut R,
        gc_horizon: Duration,
    ) -> Result<Self> {
        let handle = lock_manager.create_handle(id, TransactionKind::ReadOnly, 1);
        let read_timestamp = pick_read_timestamp(options, &clock, lock_manager, rng);
        if read_timestamp > clock.now() {
            clock.sleep_until(read_timestamp);
        }
        handle.wait_for_safe_read(read_timestamp)?;
        let schema = catalog.get_schema(read_timestamp)?;
        Ok(ReadOnlyTransaction {
            id,
            read_timestamp,
            schema,
            storage,
            clock,
            gc_horizon,
            _handle: handle,
        })
    }

    /// This transaction's id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The pinned read timestamp.
    pub fn read_timestamp(&self) -> Timestamp {
        self.read_timestamp
    }

    /// The pinned schema snapshot.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Serve a read at the pinned timestamp.
    ///
    /// The key set is canonicalised into a minimal ordered set of ranges and
    /// each range is read from storage at the read timestamp; the cursor
    /// concatenates them in key order. Fails with `OutOfRange` once the
    /// snapshot has aged past the version-GC horizon.
    pub fn read(&self, arg: &ReadArg) -> Result<RowCursor> {
        if self.clock.now().duration_since(self.read_timestamp) >= self.gc_horizon {
            return Err(Error::OutOfRange(format!(
                "read timestamp {} is past the version GC limit",
                self.read_timestamp
            )));
        }
        let target = resolve_read_target(&self.schema, arg)?;
        let key_set = retag_key_set(&target.orders, &arg.key_set)?;
        let mut rows = Vec::new();
        for range in key_set.canonicalize() {
            rows.extend(self.storage.read(
                self.read_timestamp,
                target.keyspace,
                &range,
                &target.columns,
            )?);
        }
        Ok(RowCursor::new(arg.columns.clone(), rows))
    }
}

/// A read request resolved against a schema.
pub(crate) struct ReadTarget {
    /// Storage keyspace to read: a base table or an index data table.
    pub keyspace: TableId,
    /// Projected column ids.
    pub columns: Vec<ColumnId>,
    /// Sort orders of the keyspace's key parts, for re-tagging user keys.
    pub orders: Vec<SortOrder>,
}

pub(crate) fn resolve_read_target(schema: &Schema, arg: &ReadArg) -> Result<ReadTarget> {
    let table = schema.table(&arg.table)?;
    let mut columns = Vec::with_capacity(arg.columns.len());
    match &arg.index {
        None => {
            for name in &arg.columns {
                columns.push(table.column(name)?.id);
            }
            Ok(ReadTarget {
                keyspace: table.id,
                columns,
                orders: table.primary_key.iter().map(|kc| kc.order).collect(),
            })
        }
        Some(index_name) => {
            let index = schema.index(index_name)?;
            if index.base_table != table.id {
                return Err(Error::InvalidArgument(format!(
                    "index {index_name} does not index table {}",
                    arg.table
                )));
            }
            for name in &arg.columns {
                let column = table.column(name)?;
                let available = index.has_key_column(column.id)
                    || table.is_key_column(column.id)
                    || index.stored_columns.contains(&column.id);
                if !available {
                    return Err(Error::FailedPrecondition(format!(
                        "column {name} cannot be read through index {index_name}"
                    )));
                }
                columns.push(column.id);
            }
            // Index entry keys are the indexed columns followed by the
            // primary-key parts not already indexed.
            let mut orders: Vec<SortOrder> = index.key_columns.iter().map(|kc| kc.order).collect();
            orders.extend(
                table
                    .primary_key
                    .iter()
                    .filter(|kc| !index.has_key_column(kc.column))
                    .map(|kc| kc.order),
            );
            Ok(ReadTarget {
                keyspace: index.data_table,
                columns,
                orders,
            })
        }
    }
}

/// Align every caller-supplied key in `key_set` with the keyspace's sort
/// orders.
pub(crate) fn retag_key_set(orders: &[SortOrder], key_set: &KeySet) -> Result<KeySet> {
    let retag = |key: &Key| {
        key.with_orders(orders).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "key {key} has more parts than the target keyspace ({})",
                orders.len()
            ))
        })
    };
    let retag_bound = |bound: &Bound<Key>| -> Result<Bound<Key>> {
        Ok(match bound {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(k) => Bound::Included(retag(k)?),
            Bound::Excluded(k) => Bound::Excluded(retag(k)?),
        })
    };
    let mut out = KeySet {
        all: key_set.all,
        ..KeySet::default()
    };
    for point in &key_set.points {
        out.points.push(retag(point)?);
    }
    for range in &key_set.ranges {
        out.ranges.push(KeyRange {
            start: retag_bound(&range.start)?,
            end: retag_bound(&range.end)?,
        });
    }
    Ok(out)
}

fn pick_read_timestamp<R: Rng>(
    options: &ReadOnlyOptions,
    clock: &Clock,
    lock_manager: &LockManager,
    rng: &mut R,
) -> Timestamp {
    // Reads at or before the watermark already see a consistent snapshot of
    // every finished commit, so a randomly staled timestamp never needs to
    // fall below it.
    let mut random_stale = |min_timestamp: Timestamp| {
        let floor = min_timestamp.max(lock_manager.last_commit_timestamp());
        let now = clock.now();
        if floor >= now {
            return floor;
        }
        let staleness = rng.gen_range(0..=(now.as_micros() - floor.as_micros()));
        Timestamp::from_micros(now.as_micros() - staleness)
    };
    match options.bound {
        TimestampBound::Strong => clock.now(),
        TimestampBound::ExactTimestamp(ts) => ts,
        TimestampBound::ExactStaleness(d) => clock.now().saturating_sub(d),
        TimestampBound::MinTimestamp(ts) => random_stale(ts),
        TimestampBound::MaxStaleness(d) => random_stale(clock.now().saturating_sub(d)),
    }
}
