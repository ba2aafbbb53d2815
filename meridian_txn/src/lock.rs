//! Lock manager: live-transaction registry, commit-timestamp reservation and
//! the `last_commit_timestamp` watermark readers synchronise on.

use crate::clock::Clock;
use meridian_types::{Error, Result, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, warn};

/// What a registered transaction intends to do. Only read-write and
/// schema-change transactions can hold back safe reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Snapshot reader at a fixed timestamp.
    ReadOnly,
    /// Buffers mutations and commits at a reserved timestamp.
    ReadWrite,
    /// DDL; commits a new schema snapshot at a reserved timestamp.
    SchemaChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Preparing,
}

#[derive(Debug)]
struct HandleInfo {
    kind: TransactionKind,
    priority: i32,
    phase: Phase,
    reserved: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct ManagerState {
    handles: HashMap<TransactionId, HandleInfo>,
    max_reserved: i64,
}

/// Tracks live transactions, hands out commit timestamps and advances the
/// `last_commit_timestamp` watermark on successful finalisation.
///
/// Deadlock policy is wait-die on handle priority: a safe-read waiter
/// blocked by a preparing writer of strictly higher priority aborts instead
/// of waiting. Waiters hold no resources and writers never wait on readers,
/// so cycles cannot form; the policy bounds waiting behind a stalled
/// high-priority writer.
pub struct LockManager {
    clock: Arc<Clock>,
    last_commit: AtomicI64,
    state: Mutex<ManagerState>,
    cv: Condvar,
}

impl LockManager {
    /// A lock manager sharing `clock` with the transactions it coordinates.
    pub fn new(clock: Arc<Clock>) -> Self {
        LockManager {
            clock,
            last_commit: AtomicI64::new(0),
            state: Mutex::new(ManagerState::default()),
            cv: Condvar::new(),
        }
    }

    /// The watermark of the most recent successful commit.
    pub fn last_commit_timestamp(&self) -> Timestamp {
        Timestamp::from_micros(self.last_commit.load(Ordering::SeqCst))
    }

    /// Register a transaction and return its handle. Each handle is owned by
    /// exactly one transaction and is released by `finalize` (or on drop).
    pub fn create_handle(
        self: &Arc<Self>,
        txn: TransactionId,
        kind: TransactionKind,
        priority: i32,
    ) -> LockHandle {
        let mut state = self.state.lock().unwrap();
        state.handles.insert(
            txn,
            HandleInfo {
                kind,
                priority,
                phase: Phase::Open,
                reserved: None,
            },
        );
        LockHandle {
            mgr: Arc::clone(self),
            txn,
            kind,
            priority,
            released: false,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("last_commit", &self.last_commit.load(Ordering::SeqCst))
            .finish()
    }
}

/// One transaction's registration with the [`LockManager`].
#[derive(Debug)]
pub struct LockHandle {
    mgr: Arc<LockManager>,
    txn: TransactionId,
    kind: TransactionKind,
    priority: i32,
    released: bool,
}

impl LockHandle {
    /// The owning transaction's id.
    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }

    /// Block until every read-write or schema-change transaction that has
    /// reserved a commit timestamp at or before `ts` reaches a terminal
    /// state. Returns immediately if none qualify.
    ///
    /// Writers that have not reserved yet cannot qualify: a later
    /// reservation always lands strictly above the current clock, hence
    /// above any already-chosen read timestamp.
    pub fn wait_for_safe_read(&self, ts: Timestamp) -> Result<()> {
        let mut state = self.mgr.state.lock().unwrap();
        loop {
            let blocker = state
                .handles
                .iter()
                .filter(|(id, info)| {
                    **id != self.txn
                        && matches!(
                            info.kind,
                            TransactionKind::ReadWrite | TransactionKind::SchemaChange
                        )
                        && info.phase == Phase::Preparing
                        && info.reserved.is_some_and(|r| r <= ts)
                })
                .min_by_key(|(id, _)| **id)
                .map(|(id, info)| (*id, info.priority));
            match blocker {
                None => return Ok(()),
                Some((blocker_id, blocker_priority)) => {
                    if blocker_priority > self.priority {
                        warn!(
                            txn = %self.txn,
                            blocker = %blocker_id,
                            "wait-die: aborting younger waiter"
                        );
                        return Err(Error::Aborted(format!(
                            "transaction {} aborted waiting on higher-priority transaction {}",
                            self.txn, blocker_id
                        )));
                    }
                    state = self.mgr.cv.wait(state).unwrap();
                }
            }
        }
    }

    /// Pick a commit timestamp strictly greater than the watermark, every
    /// outstanding reservation and the current clock, and mark this handle
    /// as preparing.
    pub fn reserve_commit_timestamp(&self) -> Result<Timestamp> {
        if self.kind == TransactionKind::ReadOnly {
            return Err(Error::Internal(format!(
                "read-only transaction {} cannot reserve a commit timestamp",
                self.txn
            )));
        }
        let mut state = self.mgr.state.lock().unwrap();
        let floor = self
            .mgr
            .last_commit
            .load(Ordering::SeqCst)
            .max(state.max_reserved)
            .max(self.mgr.clock.now().as_micros());
        let ts = Timestamp::from_micros(floor + 1);
        state.max_reserved = ts.as_micros();
        let info = state
            .handles
            .get_mut(&self.txn)
            .ok_or_else(|| Error::Internal(format!("handle {} is not registered", self.txn)))?;
        info.phase = Phase::Preparing;
        info.reserved = Some(ts);
        debug!(txn = %self.txn, commit_ts = %ts, "reserved commit timestamp");
        Ok(ts)
    }

    /// Release the handle. On success the reserved timestamp becomes the new
    /// `last_commit_timestamp` via a monotonic update; on failure it is
    /// discarded. Idempotent.
    pub fn finalize(&mut self, success: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.mgr.state.lock().unwrap();
        let info = state.handles.remove(&self.txn);
        if success {
            if let Some(ts) = info.and_then(|i| i.reserved) {
                self.mgr
                    .last_commit
                    .fetch_max(ts.as_micros(), Ordering::SeqCst);
                self.mgr.clock.observe(ts);
                info!(txn = %self.txn, commit_ts = %ts, "commit published");
            }
        }
        drop(state);
        self.mgr.cv.notify_all();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // An un-finalized handle counts as an abort.
        self.finalize(false);
    }
}
