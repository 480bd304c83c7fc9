//! Filesystem side of the document store.
//!
//! The managed directory is the primary content store. This crate knows how
//! to derive [`Metadata`] records from files, how to [`Scan`] a directory
//! into a stream of those records, and how to read and write documents safely
//! inside the managed directory.

pub mod error;
mod local;
mod metadata;
mod path;
mod scan;
mod value;

pub use crate::local::{LocalDirectory, check_source};
pub use crate::metadata::{DEFAULT_COLUMNS, FIELDS, FileType, Metadata, extract};
pub use crate::path::{to_index_string, validate as validate_path};
pub use crate::scan::{DirectoryScanner, MetadataStream, Scan, ScanOptions};
pub use crate::value::Value;
