//! SQLite index over the managed directory.
//!
//! The index mirrors document metadata so it can be queried and ordered. It
//! is never the source of truth: the files in the managed directory are. If
//! the database is deleted, it can be rebuilt by scanning the directory.
//!
//! # Architecture
//! - [`Schema`] verifies (or creates) the index table once and fixes the
//!   working column projection for the lifetime of the table handle.
//! - [`IndexTable`] does row-level CRUD, full reconciliation against a
//!   directory scan ([`IndexTable::load`]) and searching.
//! - Searches take an optional [`TrustedPredicate`], a raw SQL expression
//!   that is interpolated without any escaping, and an [`Order`].

mod db;
pub mod error;
mod models;
mod query;
mod schema;
mod table;

pub use crate::db::Database;
pub use crate::models::{Column, ColumnDefinitions, ColumnType, DEFAULT_COLUMNS, DocumentId, Record, check_identifier};
pub use crate::query::{Direction, Order, OrderTerm, TrustedPredicate};
pub use crate::schema::{IdColumn, Schema};
pub use crate::table::{Fields, IndexTable, RecordStream};
