//! Common error taxonomy shared by every MeridianDB layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Status code attached to every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed request: bad types, missing key columns, invalid ranges.
    InvalidArgument,
    /// Unknown table/column/index, or an update against a missing row.
    NotFound,
    /// Insert against a live row, or a unique-index violation.
    AlreadyExists,
    /// Constraint violations and misuse of an otherwise valid schema.
    FailedPrecondition,
    /// Read timestamp is past the version GC limit.
    OutOfRange,
    /// Transaction lost a conflict and should be retried by the caller.
    Aborted,
    /// Invariant violation inside the engine. Not recoverable.
    Internal,
}

/// Error surfaced to callers of the transactional core.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Named entity (or row) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Row or unique index entry already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Constraint violation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// Timestamp outside the retained version window.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// Concurrency loser; retry with a fresh transaction.
    #[error("aborted: {0}")]
    Aborted(String),
    /// Engine invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The status code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Error::OutOfRange(_) => ErrorCode::OutOfRange,
            Error::Aborted(_) => ErrorCode::Aborted,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }
}
