//! Index Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use crate::models::DocumentId;
use derive_more::{Display, Error};

/// An index error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    /// The table couldn't be created, or doesn't have the columns asked for.
    #[display("schema error: {_0}")]
    Schema(#[error(not(source))] String),
    /// No row exists for the identifier.
    #[display("no index row for document {_0}")]
    NotFound(#[error(not(source))] DocumentId),
    /// A table or column name that can't be used in a query.
    #[display("invalid identifier: {_0:?}")]
    InvalidIdentifier(#[error(not(source))] String),
    #[display("invalid index data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The directory scan feeding a reload failed.
    #[display("directory scan failed")]
    Scan,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
