//! Shared data-model primitives for MeridianDB: timestamps, typed values,
//! keys and key sets, identifier newtypes and the common error taxonomy.
#![deny(missing_docs)]

pub mod error;
pub mod ids;
pub mod key;
pub mod timestamp;
pub mod value;

pub use error::{Error, ErrorCode, Result};
pub use ids::{ColumnId, IndexId, TableId, TransactionId};
pub use key::{Key, KeyPart, KeyRange, KeySet, SortOrder};
pub use timestamp::Timestamp;
pub use value::{Type, Value};
