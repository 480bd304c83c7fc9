//! Index table verification.
//!
//! The index table's columns are data, not a compiled schema: they are read
//! from the database once, checked, and then treated as fixed for the
//! lifetime of a [`Schema`].

use crate::error::{ErrorKind, Result};
use crate::models::{Column, ColumnDefinitions, ColumnType, check_identifier, quote};
use docmgt_storage::FIELDS;
use exn::ResultExt;
use sqlx::SqlitePool;
use tracing::instrument;

/// How rows are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdColumn {
    /// An explicit `id` column (tables created by this crate).
    Id,
    /// SQLite's implicit `rowid`, for tables created elsewhere without one.
    Rowid,
}
impl IdColumn {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::Id => "\"id\"",
            Self::Rowid => "rowid",
        }
    }
}

#[derive(sqlx::FromRow)]
struct ColumnInfo {
    name: String,
    #[sqlx(rename = "type")]
    declared: String,
    pk: i64,
}

/// The verified shape of the index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    /// Every column in the table (except the identifier), in table order.
    columns: Vec<Column>,
    /// Columns returned by searches, in order.
    projection: Vec<String>,
    id: IdColumn,
    /// `id` is an `INTEGER PRIMARY KEY AUTOINCREMENT`, so SQLite never hands
    /// out the same identifier twice.
    autoincrement: bool,
}

impl Schema {
    /// Make sure `table` exists, creating it from `definitions` if it
    /// doesn't, then work out the column projection.
    ///
    /// Without an explicit `projection` the table's actual column order is
    /// adopted. An explicit projection may only name columns that exist.
    /// Failing to create the table is fatal; nothing here is retried.
    #[instrument(skip(pool, definitions))]
    pub async fn verify(
        pool: &SqlitePool,
        table: &str,
        definitions: &ColumnDefinitions,
        projection: Option<&[String]>,
    ) -> Result<Self> {
        check_identifier(table).or_raise(|| ErrorKind::Schema(format!("unusable table name {table:?}")))?;
        let mut info = Self::table_info(pool, table).await?;
        if info.is_empty() {
            Self::create_table(pool, table, definitions).await?;
            info = Self::table_info(pool, table).await?;
        }
        let id = match info.iter().any(|c| c.name == "id") {
            true => IdColumn::Id,
            false => IdColumn::Rowid,
        };
        let rowid_alias = info.iter().any(|c| c.name == "id" && c.pk == 1 && c.declared.eq_ignore_ascii_case("integer"));
        let autoincrement = rowid_alias && Self::declares_autoincrement(pool, table).await?;
        if !autoincrement {
            tracing::debug!(table, "Table does not use AUTOINCREMENT; identifiers are allocated above a high-water mark");
        }
        let columns: Vec<Column> = info
            .into_iter()
            .filter(|c| c.name != "id")
            .map(|c| Column::new(c.name, ColumnType::from_declared(&c.declared)))
            .collect();
        if !columns.iter().any(|c| c.name == "path") {
            exn::bail!(ErrorKind::Schema(format!("table `{table}` has no `path` column")));
        }
        let projection = match projection {
            Some(pinned) => {
                for name in pinned {
                    if !columns.iter().any(|c| &c.name == name) {
                        exn::bail!(ErrorKind::Schema(format!("column `{name}` does not exist in table `{table}`")));
                    }
                }
                pinned.to_vec()
            },
            None => columns.iter().map(|c| c.name.clone()).collect(),
        };
        for name in projection.iter().filter(|name| !FIELDS.contains(&name.as_str())) {
            tracing::debug!(table, column = %name, "Column is not derived from file metadata; only caller metadata fills it");
        }
        Ok(Self { table: table.to_string(), columns, projection, id, autoincrement })
    }

    async fn declares_autoincrement(pool: &SqlitePool, table: &str) -> Result<bool> {
        let sql: Option<Option<String>> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(sql.flatten().is_some_and(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT")))
    }

    async fn table_info(pool: &SqlitePool, table: &str) -> Result<Vec<ColumnInfo>> {
        sqlx::query_as::<_, ColumnInfo>("SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    async fn create_table(pool: &SqlitePool, table: &str, definitions: &ColumnDefinitions) -> Result<()> {
        let columns: Vec<String> = definitions.iter().map(Column::definition).collect();
        let sql = format!(
            "CREATE TABLE {} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, {})",
            quote(table),
            columns.join(", ")
        );
        sqlx::query(&sql)
            .execute(pool)
            .await
            .or_raise(|| ErrorKind::Schema(format!("unable to create table `{table}`")))?;
        tracing::info!(table, columns = columns.len(), "Created index table");
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn projection(&self) -> &[String] {
        &self.projection
    }

    pub fn id_column(&self) -> IdColumn {
        self.id
    }

    pub fn autoincrement(&self) -> bool {
        self.autoincrement
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Columns that a directory scan can fill: extractor fields that exist
    /// in the table.
    pub fn metadata_columns(&self) -> Vec<&'static str> {
        FIELDS.iter().copied().filter(|field| self.has_column(field)).collect()
    }

    pub(crate) fn quoted_table(&self) -> String {
        quote(&self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn names(schema: &Schema) -> Vec<&str> {
        schema.columns().iter().map(|c| c.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_creates_missing_table() {
        let db = Database::connect_in_memory().await.unwrap();
        let schema = Schema::verify(db.pool(), "files", &ColumnDefinitions::default(), None).await.unwrap();
        assert_eq!(names(&schema), FIELDS);
        assert_eq!(schema.projection(), FIELDS);
        assert_eq!(schema.id_column(), IdColumn::Id);
        assert!(schema.autoincrement());
        assert_eq!(schema.columns()[5].kind, ColumnType::Integer);
        // Verifying again reuses the table.
        let again = Schema::verify(db.pool(), "files", &ColumnDefinitions::default(), None).await.unwrap();
        assert_eq!(again, schema);
    }

    #[tokio::test]
    async fn test_adopts_existing_column_order() {
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE docs (size INTEGER, author TEXT, path)").execute(db.pool()).await.unwrap();
        let schema = Schema::verify(db.pool(), "docs", &ColumnDefinitions::default(), None).await.unwrap();
        assert_eq!(schema.projection(), ["size", "author", "path"]);
        assert_eq!(schema.id_column(), IdColumn::Rowid);
        assert!(!schema.autoincrement());
        assert_eq!(schema.metadata_columns(), ["path", "size"]);
        assert!(schema.has_column("author"));
    }

    #[tokio::test]
    async fn test_plain_integer_primary_key_is_not_autoincrement() {
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE docs (id INTEGER PRIMARY KEY, path TEXT)").execute(db.pool()).await.unwrap();
        let schema = Schema::verify(db.pool(), "docs", &ColumnDefinitions::default(), None).await.unwrap();
        assert_eq!(schema.id_column(), IdColumn::Id);
        assert!(!schema.autoincrement());
    }

    #[tokio::test]
    async fn test_explicit_projection() {
        let db = Database::connect_in_memory().await.unwrap();
        let pinned = vec!["name".to_string(), "path".to_string()];
        let schema = Schema::verify(db.pool(), "files", &ColumnDefinitions::default(), Some(pinned.as_slice())).await.unwrap();
        assert_eq!(schema.projection(), ["name", "path"]);
        // The full column set is still known.
        assert_eq!(names(&schema).len(), FIELDS.len());
    }

    #[tokio::test]
    async fn test_explicit_projection_must_exist() {
        let db = Database::connect_in_memory().await.unwrap();
        let pinned = vec!["path".to_string(), "author".to_string()];
        let err = Schema::verify(db.pool(), "files", &ColumnDefinitions::default(), Some(pinned.as_slice())).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Schema(_)));
    }

    #[tokio::test]
    async fn test_requires_path_column() {
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE other (title TEXT)").execute(db.pool()).await.unwrap();
        let err = Schema::verify(db.pool(), "other", &ColumnDefinitions::default(), None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Schema(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_table_name() {
        let db = Database::connect_in_memory().await.unwrap();
        let err = Schema::verify(db.pool(), "files; --", &ColumnDefinitions::default(), None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Schema(_)));
    }

    #[tokio::test]
    async fn test_custom_definitions() {
        let db = Database::connect_in_memory().await.unwrap();
        let definitions: ColumnDefinitions = "path, name, author text, size integer".parse().unwrap();
        let schema = Schema::verify(db.pool(), "library", &definitions, None).await.unwrap();
        assert_eq!(names(&schema), ["path", "name", "author", "size"]);
        assert_eq!(schema.metadata_columns(), ["path", "name", "size"]);
    }
}
