use crate::error::{ErrorKind, Result};
use derive_more::Display;
use docmgt_storage::Value;
use exn::ResultExt;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};

/// Identifier assigned to a document by the index.
///
/// An identifier is never handed out twice by the same index, even after the
/// document it belonged to is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, sqlx::Type)]
#[display("{_0}")]
#[sqlx(transparent)]
pub struct DocumentId(i64);
impl DocumentId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}
impl From<i64> for DocumentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One row of the index, projected onto the working column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: DocumentId,
    fields: Vec<(String, Value)>,
}
impl Record {
    pub fn new(id: DocumentId, fields: Vec<(String, Value)>) -> Self {
        Self { id, fields }
    }

    /// Look up a column's value; `None` if the column isn't part of the
    /// projection (as opposed to [`Value::Null`] for an empty column).
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    pub fn path(&self) -> Option<&str> {
        self.get("path").and_then(Value::as_str)
    }

    /// Fields in projection order.
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }

    /// Decode a row selected as `id, <projection...>`.
    pub(crate) fn from_row(row: &SqliteRow, projection: &[String]) -> Result<Self> {
        let id: DocumentId = row.try_get(0).or_raise(|| ErrorKind::InvalidData("document id"))?;
        let fields = projection
            .iter()
            .enumerate()
            .map(|(offset, name)| Ok((name.clone(), decode_value(row, offset + 1)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { id, fields })
    }
}

/// Read a column of any storage class into a [`Value`].
fn decode_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index).or_raise(|| ErrorKind::InvalidData("column value"))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    // The value's own storage class, not the column's declared type: columns
    // without a declared type can hold anything.
    let value = match raw.type_info().name() {
        "INTEGER" => Value::Integer(row.try_get_unchecked(index).or_raise(|| ErrorKind::InvalidData("integer"))?),
        "REAL" => Value::Real(row.try_get_unchecked(index).or_raise(|| ErrorKind::InvalidData("real"))?),
        "TEXT" => Value::Text(row.try_get_unchecked(index).or_raise(|| ErrorKind::InvalidData("text"))?),
        _ => Value::Blob(row.try_get_unchecked(index).or_raise(|| ErrorKind::InvalidData("blob"))?),
    };
    Ok(value)
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(i) => query.bind(*i),
        Value::Real(r) => query.bind(*r),
        Value::Text(s) => query.bind(s.clone()),
        Value::Blob(b) => query.bind(b.clone()),
    }
}
