//! Identifier newtypes. Entities own their data; cross-references between
//! tables and indexes go through these ids resolved via the schema.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

id_type! {
    /// Stable identifier of a table. Index entries live in their own table id
    /// space, so an index's backing store is also addressed by a `TableId`.
    TableId
}

id_type! {
    /// Stable identifier of a secondary index.
    IndexId
}

id_type! {
    /// Stable identifier of a column within its table.
    ColumnId
}

id_type! {
    /// Process-unique, monotonically assigned transaction identifier.
    /// A lower id means an older transaction.
    TransactionId
}
