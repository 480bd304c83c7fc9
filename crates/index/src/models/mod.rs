mod column;
mod record;

pub use self::column::{Column, ColumnDefinitions, ColumnType, DEFAULT_COLUMNS, check_identifier};
pub(crate) use self::column::quote;
pub use self::record::{DocumentId, Record};
pub(crate) use self::record::bind_value;
