//! Query inputs: predicates and ordering.

use crate::error::{ErrorKind, Result};
use crate::models::quote;
use docmgt_storage::Value;
use std::cmp::Ordering;

/// A raw boolean expression in SQLite syntax, interpolated verbatim into a
/// `WHERE` clause.
///
/// **This is a trust boundary.** Nothing is escaped or checked: whoever
/// constructs a `TrustedPredicate` can run arbitrary SQL against the index.
/// Never build one from untrusted input.
///
/// ```
/// use docmgt_index::TrustedPredicate;
///
/// let predicate = TrustedPredicate::new("ext = 'txt' AND size > 1024");
/// assert_eq!(predicate.as_sql(), "ext = 'txt' AND size > 1024");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPredicate(String);
impl TrustedPredicate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn as_sql(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A single resolved `column [asc|desc]` ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub direction: Direction,
}
impl OrderTerm {
    fn sql(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        format!("{} {direction}", quote(&self.column))
    }

    /// Compare two values the way this term would order them.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match self.direction {
            Direction::Ascending => a.sort_cmp(b),
            Direction::Descending => b.sort_cmp(a),
        }
    }
}

/// Ordering for search results.
///
/// Accepts a single column, a comma-joined string, or a sequence of columns;
/// each may be followed by `asc` or `desc`. The default is `path`, which
/// keeps search results in the same order as a sorted directory scan.
///
/// ```
/// use docmgt_index::Order;
///
/// assert_eq!(Order::from("ext, size desc"), Order::from(vec!["ext", "size desc"]));
/// assert_eq!(Order::default(), Order::from("path"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order(Vec<String>);
impl Default for Order {
    fn default() -> Self {
        Self(vec!["path".to_string()])
    }
}
impl From<&str> for Order {
    fn from(value: &str) -> Self {
        Self(value.split(',').map(|term| term.trim().to_string()).filter(|term| !term.is_empty()).collect())
    }
}
impl From<String> for Order {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}
impl From<Vec<String>> for Order {
    fn from(value: Vec<String>) -> Self {
        Self(value.into_iter().map(|term| term.trim().to_string()).collect())
    }
}
impl From<Vec<&str>> for Order {
    fn from(value: Vec<&str>) -> Self {
        Self(value.into_iter().map(|term| term.trim().to_string()).collect())
    }
}
impl From<&[&str]> for Order {
    fn from(value: &[&str]) -> Self {
        Self::from(value.to_vec())
    }
}
impl Order {
    /// Parse and validate the ordering terms. `is_known` decides which
    /// column names are acceptable; unknown columns are a schema error.
    pub fn resolve(&self, is_known: impl Fn(&str) -> bool) -> Result<Vec<OrderTerm>> {
        if self.0.is_empty() {
            exn::bail!(ErrorKind::Schema("empty ordering".to_string()));
        }
        self.0
            .iter()
            .map(|term| {
                let mut parts = term.split_whitespace();
                let column = parts.next().unwrap_or_default();
                let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                    None | Some("asc") => Direction::Ascending,
                    Some("desc") => Direction::Descending,
                    Some(_) => exn::bail!(ErrorKind::Schema(format!("invalid ordering term {term:?}"))),
                };
                if parts.next().is_some() {
                    exn::bail!(ErrorKind::Schema(format!("invalid ordering term {term:?}")));
                }
                if !is_known(column) {
                    exn::bail!(ErrorKind::Schema(format!("cannot order by unknown column {column:?}")));
                }
                Ok(OrderTerm { column: column.to_string(), direction })
            })
            .collect()
    }
}

pub(crate) fn order_by_sql(terms: &[OrderTerm]) -> String {
    terms.iter().map(OrderTerm::sql).collect::<Vec<_>>().join(", ")
}
