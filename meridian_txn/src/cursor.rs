//! Row cursor returned by reads.

use meridian_storage::StoredRow;
use meridian_types::Value;

/// One projected row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Values in the order of the requested columns.
    pub values: Vec<Value>,
}

/// Cursor over the rows of a read, concatenating the canonicalised key
/// ranges in key order.
#[derive(Debug)]
pub struct RowCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<StoredRow>,
}

impl RowCursor {
    /// Wrap already-collected rows.
    pub fn new(columns: Vec<String>, rows: Vec<StoredRow>) -> Self {
        RowCursor {
            columns,
            rows: rows.into_iter(),
        }
    }

    /// The projected column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Drain the cursor into a list of value rows. Convenient in tests.
    pub fn into_values(self) -> Vec<Vec<Value>> {
        self.map(|row| row.values).collect()
    }
}

impl Iterator for RowCursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next().map(|stored| Row {
            values: stored.values,
        })
    }
}
