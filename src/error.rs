//! Document Manager Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors from the storage and index
//! crates are kept as children of the error tree; the kinds here are the
//! ones a caller is expected to act on.

use derive_more::{Display, Error};
use docmgt_index::DocumentId;
use docmgt_index::error::{Error as IndexError, ErrorKind as IndexErrorKind};
use docmgt_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};
use exn::ResultExt;
use std::path::{Path, PathBuf};

/// A document manager error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for document manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Nothing is retried internally; retry policy belongs to the caller.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No document exists with this identifier.
    #[display("document {_0} not found")]
    NotFound(#[error(not(source))] DocumentId),
    /// The index knows the document but its file is gone. Run
    /// [`load_db`](crate::Documents::load_db) to reconcile.
    #[display("file for document {_0} is missing: {}", _1.display())]
    FileMissing(#[error(not(source))] DocumentId, #[error(not(source))] PathBuf),
    /// The external file to copy or append from doesn't exist.
    #[display("source file not found: {}", _0.display())]
    SourceNotFound(#[error(not(source))] PathBuf),
    /// The external file to copy or append from isn't a regular file.
    #[display("source is not a regular file: {}", _0.display())]
    SourceNotAFile(#[error(not(source))] PathBuf),
    /// The index table couldn't be created or doesn't fit the requested
    /// columns or ordering.
    #[display("index schema error")]
    Schema,
    /// Reading, writing or removing a file failed.
    #[display("I/O error")]
    Io,
    /// Any other index failure.
    #[display("index error")]
    Index,
    /// The operation needs an index, but the manager runs without one.
    #[display("operation requires an index")]
    IndexDisabled,
    /// Construction options are unusable.
    #[display("configuration error")]
    Config,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<&IndexErrorKind> for ErrorKind {
    fn from(kind: &IndexErrorKind) -> Self {
        match kind {
            IndexErrorKind::NotFound(id) => Self::NotFound(*id),
            IndexErrorKind::Schema(_) | IndexErrorKind::InvalidIdentifier(_) => Self::Schema,
            IndexErrorKind::Scan => Self::Io,
            IndexErrorKind::Database | IndexErrorKind::InvalidData(_) => Self::Index,
        }
    }
}

/// Raise lower-level errors into this crate's kinds, keeping the original as
/// the child of the new error.
pub(crate) trait RaiseExt<T> {
    fn or_kind(self) -> Result<T>;
}

impl<T> RaiseExt<T> for std::result::Result<T, IndexError> {
    #[track_caller]
    fn or_kind(self) -> Result<T> {
        self.or_else(|err| {
            let kind = ErrorKind::from(&*err);
            Err(err).or_raise(|| kind)
        })
    }
}

impl<T> RaiseExt<T> for std::result::Result<T, StorageError> {
    #[track_caller]
    fn or_kind(self) -> Result<T> {
        self.or_raise(|| ErrorKind::Io)
    }
}

pub(crate) trait StorageResultExt<T> {
    /// A vanished document file becomes [`ErrorKind::FileMissing`].
    fn or_missing(self, id: DocumentId, path: &Path) -> Result<T>;
    /// A failed source check becomes [`ErrorKind::SourceNotFound`] or
    /// [`ErrorKind::SourceNotAFile`].
    fn or_source(self, source: &Path) -> Result<T>;
}

impl<T> StorageResultExt<T> for std::result::Result<T, StorageError> {
    fn or_missing(self, id: DocumentId, path: &Path) -> Result<T> {
        self.or_else(|err| {
            let kind = match &*err {
                StorageErrorKind::NotFound(_) => ErrorKind::FileMissing(id, path.to_path_buf()),
                _ => ErrorKind::Io,
            };
            Err(err).or_raise(|| kind)
        })
    }

    fn or_source(self, source: &Path) -> Result<T> {
        self.or_else(|err| {
            let kind = match &*err {
                StorageErrorKind::NotFound(_) => ErrorKind::SourceNotFound(source.to_path_buf()),
                StorageErrorKind::NotAFile(_) => ErrorKind::SourceNotAFile(source.to_path_buf()),
                _ => ErrorKind::Io,
            };
            Err(err).or_raise(|| kind)
        })
    }
}
