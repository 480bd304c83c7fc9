use crate::error::{Error, ErrorKind, Result};
use derive_more::Display;
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

pub use docmgt_storage::DEFAULT_COLUMNS;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Check that a table or column name is a plain SQL identifier.
pub fn check_identifier(name: &str) -> Result<&str> {
    match IDENTIFIER.is_match(name) {
        true => Ok(name),
        false => exn::bail!(ErrorKind::InvalidIdentifier(name.to_string())),
    }
}

/// Quote an identifier for interpolation into SQL.
///
/// Column names read back from an existing table may not pass
/// [`check_identifier`], so embedded quotes are escaped rather than rejected.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Semantic type of a column, following SQLite's type affinity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ColumnType {
    /// No declared type; values are stored as given.
    #[display("")]
    Untyped,
    #[display("TEXT")]
    Text,
    #[display("INTEGER")]
    Integer,
    #[display("REAL")]
    Real,
    #[display("BLOB")]
    Blob,
    #[display("NUMERIC")]
    Numeric,
}
impl ColumnType {
    /// Determine the affinity of a declared column type (`"varchar(20)"`,
    /// `"integer"`, `""`, ...).
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.trim().to_ascii_uppercase();
        if declared.is_empty() {
            return Self::Untyped;
        }
        if declared.contains("INT") {
            return Self::Integer;
        }
        if ["CHAR", "CLOB", "TEXT"].iter().any(|t| declared.contains(t)) {
            return Self::Text;
        }
        if declared.contains("BLOB") {
            return Self::Blob;
        }
        if ["REAL", "FLOA", "DOUB"].iter().any(|t| declared.contains(t)) {
            return Self::Real;
        }
        Self::Numeric
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}
impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self { name: name.into(), kind }
    }

    pub(crate) fn definition(&self) -> String {
        match self.kind {
            ColumnType::Untyped => quote(&self.name),
            kind => format!("{} {kind}", quote(&self.name)),
        }
    }
}

/// An ordered list of `name [type]` column definitions.
///
/// ```
/// use docmgt_index::{ColumnDefinitions, ColumnType};
///
/// let columns: ColumnDefinitions = "path, title text, pages integer".parse().unwrap();
/// assert_eq!(columns.names().collect::<Vec<_>>(), ["path", "title", "pages"]);
/// assert_eq!(columns.iter().last().unwrap().kind, ColumnType::Integer);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinitions(Vec<Column>);
impl ColumnDefinitions {
    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.name.as_str())
    }
}
impl Default for ColumnDefinitions {
    /// The columns described by [`DEFAULT_COLUMNS`].
    fn default() -> Self {
        use ColumnType::{Integer, Untyped};
        let columns = [
            ("path", Untyped),
            ("name", Untyped),
            ("ext", Untyped),
            ("filetype", Untyped),
            ("modestr", Untyped),
            ("size", Integer),
            ("uid", Integer),
            ("gid", Integer),
            ("mtime", Integer),
        ];
        Self(columns.into_iter().map(|(name, kind)| Column::new(name, kind)).collect())
    }
}
impl FromStr for ColumnDefinitions {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut columns: Vec<Column> = Vec::new();
        for definition in s.split(',') {
            let mut parts = definition.split_whitespace();
            let Some(name) = parts.next() else {
                exn::bail!(ErrorKind::Schema(format!("empty column definition in {s:?}")));
            };
            check_identifier(name)?;
            if name.eq_ignore_ascii_case("id") {
                exn::bail!(ErrorKind::Schema("`id` is reserved for the document identifier".to_string()));
            }
            if columns.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
                exn::bail!(ErrorKind::Schema(format!("column `{name}` defined twice")));
            }
            let declared = parts.collect::<Vec<_>>().join(" ");
            columns.push(Column::new(name, ColumnType::from_declared(&declared)));
        }
        Ok(Self(columns))
    }
}
