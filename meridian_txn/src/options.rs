//! Transaction options and read requests.

use meridian_types::{KeySet, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a read-only transaction's snapshot timestamp is chosen.
///
/// The randomised variants emulate reading from lagging replicas while never
/// selecting a snapshot older than the last observed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampBound {
    /// Read at the current clock time.
    Strong,
    /// Read at the given instant; a future instant blocks until the clock
    /// reaches it.
    ExactTimestamp(Timestamp),
    /// Read exactly this far in the past.
    ExactStaleness(Duration),
    /// Read at a uniformly random instant in `[max(t, watermark), now]`.
    MinTimestamp(Timestamp),
    /// Read at a uniformly random instant in
    /// `[max(now - d, watermark), now]`.
    MaxStaleness(Duration),
}

/// Options for constructing a read-only transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyOptions {
    /// Timestamp-bound variant.
    pub bound: TimestampBound,
}

impl Default for ReadOnlyOptions {
    fn default() -> Self {
        ReadOnlyOptions {
            bound: TimestampBound::Strong,
        }
    }
}

impl ReadOnlyOptions {
    /// Strong-read options.
    pub fn strong() -> Self {
        ReadOnlyOptions::default()
    }

    /// Exact-timestamp options.
    pub fn exact_timestamp(ts: Timestamp) -> Self {
        ReadOnlyOptions {
            bound: TimestampBound::ExactTimestamp(ts),
        }
    }

    /// Exact-staleness options.
    pub fn exact_staleness(d: Duration) -> Self {
        ReadOnlyOptions {
            bound: TimestampBound::ExactStaleness(d),
        }
    }

    /// Min-timestamp options.
    pub fn min_timestamp(ts: Timestamp) -> Self {
        ReadOnlyOptions {
            bound: TimestampBound::MinTimestamp(ts),
        }
    }

    /// Max-staleness options.
    pub fn max_staleness(d: Duration) -> Self {
        ReadOnlyOptions {
            bound: TimestampBound::MaxStaleness(d),
        }
    }
}

/// One read request: a table (optionally through an index), the columns to
/// project and the keys to visit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadArg {
    /// Base table name.
    pub table: String,
    /// Index to read through, if any. Keys in `key_set` are then index keys.
    pub index: Option<String>,
    /// Column names to project.
    pub columns: Vec<String>,
    /// Which keys to read.
    pub key_set: KeySet,
}

impl ReadArg {
    /// A full-table (or full-index) scan projecting `columns`.
    pub fn scan(table: &str, columns: &[&str]) -> Self {
        ReadArg {
            table: table.to_owned(),
            index: None,
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            key_set: KeySet::all(),
        }
    }

    /// Route the read through `index`.
    pub fn with_index(mut self, index: &str) -> Self {
        self.index = Some(index.to_owned());
        self
    }

    /// Restrict the read to `key_set`.
    pub fn with_key_set(mut self, key_set: KeySet) -> Self {
        self.key_set = key_set;
        self
    }
}
