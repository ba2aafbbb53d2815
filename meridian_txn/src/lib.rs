//! Transaction layer: the monotonic clock, the lock manager with its
//! commit-timestamp watermark, and the read-only / read-write transaction
//! protocols.
#![deny(missing_docs)]

pub mod clock;
pub mod cursor;
pub mod lock;
pub mod mutation;
pub mod options;
pub mod read_only;
pub mod read_write;

pub use clock::{Clock, FakeTimeSource, SystemTimeSource, TimeSource};
pub use cursor::{Row, RowCursor};
pub use lock::{LockHandle, LockManager, TransactionKind};
pub use mutation::{Mutation, MutationOp};
pub use options::{ReadArg, ReadOnlyOptions, TimestampBound};
pub use read_only::ReadOnlyTransaction;
pub use read_write::{ReadWriteTransaction, TransactionState};
