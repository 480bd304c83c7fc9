//! A filesystem document store with a synchronised SQLite metadata index.
//!
//! A managed directory holds the documents; an index table mirrors each
//! file's metadata (path, name, extension, type, permissions, size, owner,
//! modification time) so documents can be searched and ordered. The
//! directory is the source of truth: the index can be rebuilt from it at any
//! time with [`Documents::load_db`], and is rebuilt automatically on open
//! unless [`Authority::Index`] is configured.
//!
//! # Crates
//! - `docmgt-storage`: metadata extraction, directory scanning and file
//!   primitives.
//! - `docmgt-index`: the SQLite index table, reconciliation and search.
//! - `docmgt-config`: construction options and layered configuration.
//!
//! Without an index (`no_index`), metadata is kept in memory and rebuilt from
//! a scan on open; searches can be ordered but not filtered.

mod catalog;
mod documents;
pub mod error;
mod naming;

pub use crate::documents::{Documents, DocumentsBuilder};
pub use crate::naming::{NamePolicy, NameRequest, NumericSuffix};
pub use docmgt_config::{Authority, Options};
pub use docmgt_index::{DocumentId, Fields, Order, Record, RecordStream, TrustedPredicate};
pub use docmgt_storage::{DirectoryScanner, Metadata, MetadataStream, Scan, ScanOptions, Value};
