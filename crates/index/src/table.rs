//! Row-level access to the index table.
//!
//! The table mirrors the managed directory; it is never the source of truth
//! for content. Any row can be rebuilt from a directory scan with
//! [`IndexTable::load`].

use crate::error::{ErrorKind, Result};
use crate::models::{ColumnDefinitions, DocumentId, Record, bind_value, quote};
use crate::query::{Order, TrustedPredicate, order_by_sql};
use crate::schema::Schema;
use docmgt_storage::error::ErrorKind as StorageErrorKind;
use docmgt_storage::{Metadata, MetadataStream, Value, validate_path};
use exn::{OptionExt, ResultExt};
use futures::{Stream, StreamExt};
use sqlx::{SqliteExecutor, SqlitePool};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::instrument;

/// Column values keyed by column name.
pub type Fields = BTreeMap<String, Value>;

/// Lazy sequence of search results.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record>> + Send + 'static>>;

/// The verified index table and the pool it lives in.
///
/// Identifiers are never reused while a table is open. Tables with an
/// `AUTOINCREMENT` id get that from SQLite; for any other table the highest
/// identifier handed out so far is remembered and new rows are numbered
/// above it, even if the rows below were deleted.
#[derive(Debug, Clone)]
pub struct IndexTable {
    pool: SqlitePool,
    schema: Arc<Schema>,
    high_water: Arc<AtomicI64>,
}

impl IndexTable {
    /// Verify (creating if necessary) `table` and wrap it.
    pub async fn open(
        pool: SqlitePool,
        table: &str,
        definitions: &ColumnDefinitions,
        projection: Option<&[String]>,
    ) -> Result<Self> {
        let schema = Schema::verify(&pool, table, definitions, projection).await?;
        let high_water = Self::max_id(&pool, &schema).await?;
        Ok(Self { pool, schema: Arc::new(schema), high_water: Arc::new(AtomicI64::new(high_water)) })
    }

    async fn max_id<'e>(executor: impl SqliteExecutor<'e>, schema: &Schema) -> Result<i64> {
        let sql = format!("SELECT COALESCE(MAX({}), 0) FROM {}", schema.id_column().sql(), schema.quoted_table());
        sqlx::query_scalar(&sql).fetch_one(executor).await.or_raise(|| ErrorKind::Database)
    }

    /// The identifier to give the next row explicitly, or `None` when SQLite
    /// can be left to pick one.
    async fn next_id(&self) -> Result<Option<i64>> {
        if self.schema.autoincrement() {
            return Ok(None);
        }
        let current = Self::max_id(&self.pool, &self.schema).await?;
        Ok(Some(current.max(self.high_water.load(Ordering::SeqCst)) + 1))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Keep only the fields that name a column of the table.
    fn known_fields<'a>(&self, fields: &'a Fields) -> Vec<(&'a str, &'a Value)> {
        fields
            .iter()
            .filter(|(name, _)| match self.schema.has_column(name) {
                true => true,
                false => {
                    tracing::debug!(table = self.schema.table(), field = %name, "Dropping field with no matching column");
                    false
                },
            })
            .map(|(name, value)| (name.as_str(), value))
            .collect()
    }

    /// Insert a row and return its identifier. Fields without a matching
    /// column are dropped.
    #[instrument(skip_all, fields(table = self.schema.table()))]
    pub async fn insert(&self, fields: &Fields) -> Result<DocumentId> {
        let next_id = self.next_id().await?;
        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(id) = next_id {
            columns.push(self.schema.id_column().sql().to_string());
            values.push(Value::Integer(id));
        }
        for (name, value) in self.known_fields(fields) {
            columns.push(quote(name));
            values.push(value.clone());
        }
        let sql = match columns.is_empty() {
            true => format!("INSERT INTO {} DEFAULT VALUES", self.schema.quoted_table()),
            false => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.schema.quoted_table(),
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            ),
        };
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = bind_value(query, value);
        }
        let result = query.execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        let id = result.last_insert_rowid();
        self.high_water.fetch_max(id, Ordering::SeqCst);
        Ok(DocumentId::new(id))
    }

    /// Overwrite the given columns of an existing row.
    #[instrument(skip(self, fields), fields(table = self.schema.table()))]
    pub async fn update(&self, id: DocumentId, fields: &Fields) -> Result<()> {
        let known = self.known_fields(fields);
        if known.is_empty() {
            return self.ensure_exists(id).await;
        }
        let assignments: Vec<String> = known.iter().map(|(name, _)| format!("{} = ?", quote(name))).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.schema.quoted_table(),
            assignments.join(", "),
            self.schema.id_column().sql()
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in &known {
            query = bind_value(query, value);
        }
        let result = query.bind(id).execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(id));
        }
        Ok(())
    }

    /// Push freshly extracted file metadata into a row.
    pub async fn refresh(&self, id: DocumentId, metadata: &Metadata) -> Result<()> {
        let fields: Fields = self
            .schema
            .metadata_columns()
            .into_iter()
            .filter_map(|column| metadata.get(column).map(|value| (column.to_string(), value)))
            .collect();
        self.update(id, &fields).await
    }

    async fn ensure_exists(&self, id: DocumentId) -> Result<()> {
        let sql = format!("SELECT 1 FROM {} WHERE {} = ?", self.schema.quoted_table(), self.schema.id_column().sql());
        let found: Option<i64> =
            sqlx::query_scalar(&sql).bind(id).fetch_optional(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        match found {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::NotFound(id)),
        }
    }

    fn select_sql(&self) -> String {
        let mut columns = vec![format!("{} AS \"id\"", self.schema.id_column().sql())];
        columns.extend(self.schema.projection().iter().map(|name| quote(name)));
        format!("SELECT {} FROM {}", columns.join(", "), self.schema.quoted_table())
    }

    /// Fetch a single row, projected onto the working column list.
    pub async fn get(&self, id: DocumentId) -> Result<Record> {
        let sql = format!("{} WHERE {} = ?", self.select_sql(), self.schema.id_column().sql());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?
            .ok_or_raise(|| ErrorKind::NotFound(id))?;
        Record::from_row(&row, self.schema.projection())
    }

    /// Resolve a document to its path relative to the managed directory.
    pub async fn path_of(&self, id: DocumentId) -> Result<PathBuf> {
        let sql = format!(
            "SELECT \"path\" FROM {} WHERE {} = ?",
            self.schema.quoted_table(),
            self.schema.id_column().sql()
        );
        let path: Option<Option<String>> =
            sqlx::query_scalar(&sql).bind(id).fetch_optional(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        match path {
            None => exn::bail!(ErrorKind::NotFound(id)),
            // A row whose name was never assigned (failed create).
            Some(None) => exn::bail!(ErrorKind::InvalidData("document has no path")),
            Some(Some(path)) => validate_path(&path).or_raise(|| ErrorKind::InvalidData("document path")),
        }
    }

    pub async fn remove(&self, id: DocumentId) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", self.schema.quoted_table(), self.schema.id_column().sql());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(id));
        }
        Ok(())
    }

    /// Replace every row with the records produced by a directory scan.
    ///
    /// Runs in a single transaction: if the scan or any insert fails the
    /// previous contents are left untouched. Entries the scan reports as
    /// [`Unreadable`](StorageErrorKind::Unreadable) are skipped with a
    /// warning; any other scan error aborts the load. Returns the number of
    /// rows written.
    #[instrument(skip_all, fields(table = self.schema.table()))]
    pub async fn load(&self, mut records: MetadataStream<'_>) -> Result<u64> {
        let columns = self.schema.metadata_columns();
        let explicit_ids = !self.schema.autoincrement();
        let mut names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        if explicit_ids {
            names.insert(0, self.schema.id_column().sql().to_string());
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.schema.quoted_table(),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut last_id = match explicit_ids {
            true => Some(Self::max_id(&mut *tx, &self.schema).await?.max(self.high_water.load(Ordering::SeqCst))),
            false => None,
        };
        sqlx::query(&format!("DELETE FROM {}", self.schema.quoted_table()))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let (mut count, mut skipped) = (0, 0);
        while let Some(metadata) = records.next().await {
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(err) if matches!(&*err, StorageErrorKind::Unreadable(_)) => {
                    tracing::warn!(error = %err, "Skipping directory entry");
                    skipped += 1;
                    continue;
                },
                Err(err) => return Err(err).or_raise(|| ErrorKind::Scan),
            };
            let mut query = sqlx::query(&sql);
            if let Some(id) = last_id.as_mut() {
                *id += 1;
                query = query.bind(*id);
            }
            for column in &columns {
                query = bind_value(query, &metadata.get(column).unwrap_or(Value::Null));
            }
            query.execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
            count += 1;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        if let Some(id) = last_id {
            self.high_water.fetch_max(id, Ordering::SeqCst);
        }
        tracing::info!(rows = count, skipped, "Reloaded index from directory scan");
        Ok(count)
    }

    /// Query the index.
    ///
    /// See [`TrustedPredicate`] for the trust boundary on `predicate`. Order
    /// terms may name any projected column or `id`.
    ///
    /// The stream holds a pooled connection until it is dropped.
    #[instrument(skip(self), fields(table = self.schema.table()))]
    pub fn search(&self, predicate: Option<&TrustedPredicate>, order: &Order) -> Result<RecordStream> {
        let terms = order.resolve(|column| column == "id" || self.schema.projection().iter().any(|p| p == column))?;
        let mut sql = self.select_sql();
        if let Some(predicate) = predicate {
            sql.push_str(&format!(" WHERE ({})", predicate.as_sql()));
        }
        sql.push_str(&format!(" ORDER BY {}", order_by_sql(&terms)));
        tracing::trace!(sql, "Searching index");
        let pool = self.pool.clone();
        let schema = self.schema.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Database) {
                    Ok(row) => yield Record::from_row(&row, schema.projection()),
                    Err(err) => {
                        yield Err(err);
                        break;
                    },
                }
            }
        }))
    }

    /// [`search`](Self::search), collected.
    pub async fn search_all(&self, predicate: Option<&TrustedPredicate>, order: &Order) -> Result<Vec<Record>> {
        let mut stream = self.search(predicate, order)?;
        let mut records = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use docmgt_storage::{DirectoryScanner, Scan, ScanOptions};
    use std::fs;
    use tempfile::tempdir;

    async fn table() -> IndexTable {
        let db = Database::connect_in_memory().await.unwrap();
        IndexTable::open(db.pool().clone(), "files", &ColumnDefinitions::default(), None).await.unwrap()
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
    }

    fn paths(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(Record::path).collect()
    }

    #[tokio::test]
    async fn test_insert_update_get() {
        let table = table().await;
        let id = table.insert(&Fields::new()).await.unwrap();
        assert_eq!(id, DocumentId::new(1));
        table.update(id, &fields(&[("path", "file1".into()), ("size", 3i64.into())])).await.unwrap();
        let record = table.get(id).await.unwrap();
        assert_eq!(record.path(), Some("file1"));
        assert_eq!(record.get("size"), Some(&Value::Integer(3)));
        assert_eq!(record.get("ext"), Some(&Value::Null));
        assert_eq!(table.path_of(id).await.unwrap(), PathBuf::from("file1"));
    }

    #[tokio::test]
    async fn test_unknown_fields_are_dropped() {
        let table = table().await;
        let id = table.insert(&fields(&[("path", "notes.txt".into()), ("author", "someone".into())])).await.unwrap();
        let record = table.get(id).await.unwrap();
        assert_eq!(record.path(), Some("notes.txt"));
        assert_eq!(record.get("author"), None);
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let table = table().await;
        let missing = DocumentId::new(99);
        assert!(matches!(&*table.get(missing).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*table.path_of(missing).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*table.remove(missing).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*table.update(missing, &Fields::new()).await.unwrap_err(), ErrorKind::NotFound(_)));
        let err = table.update(missing, &fields(&[("path", "x".into())])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let table = table().await;
        let first = table.insert(&fields(&[("path", "a".into())])).await.unwrap();
        table.remove(first).await.unwrap();
        let second = table.insert(&fields(&[("path", "b".into())])).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_unnamed_row_has_no_path() {
        let table = table().await;
        let id = table.insert(&Fields::new()).await.unwrap();
        assert!(matches!(&*table.path_of(id).await.unwrap_err(), ErrorKind::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_load_replaces_rows() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.nottxt"), "bb").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let table = table().await;
        table.insert(&fields(&[("path", "stale".into())])).await.unwrap();
        let scanner = DirectoryScanner::new(dir.path(), ScanOptions::default());

        assert_eq!(table.load(scanner.scan()).await.unwrap(), 2);
        // Loading twice gives the same result.
        assert_eq!(table.load(scanner.scan()).await.unwrap(), 2);

        let records = table.search_all(None, &Order::default()).await.unwrap();
        assert_eq!(paths(&records), ["a.txt", "b.nottxt"]);
        let exts: Vec<_> = records.iter().map(|r| r.get("ext").unwrap().clone()).collect();
        assert_eq!(exts, [Value::from("txt"), Value::from("nottxt")]);
        assert_eq!(records[1].get("size"), Some(&Value::Integer(2)));
        assert_eq!(records[0].get("filetype"), Some(&Value::from("-")));
    }

    #[tokio::test]
    async fn test_load_only_fills_metadata_columns() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("report.pdf"), "%PDF").unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let definitions: ColumnDefinitions = "path, author text, size integer".parse().unwrap();
        let table = IndexTable::open(db.pool().clone(), "library", &definitions, None).await.unwrap();
        let scanner = DirectoryScanner::new(dir.path(), ScanOptions::default());
        table.load(scanner.scan()).await.unwrap();
        let records = table.search_all(None, &Order::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("author"), Some(&Value::Null));
        assert_eq!(records[0].get("size"), Some(&Value::Integer(4)));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_rows() {
        struct Broken;
        impl Scan for Broken {
            fn scan(&self) -> MetadataStream<'_> {
                let err = exn::Exn::from(docmgt_storage::error::ErrorKind::InvalidData("broken entry"));
                Box::pin(futures::stream::iter([Err(err)]))
            }
        }
        let table = table().await;
        table.insert(&fields(&[("path", "kept".into())])).await.unwrap();
        let err = table.load(Broken.scan()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Scan));
        let records = table.search_all(None, &Order::default()).await.unwrap();
        assert_eq!(paths(&records), ["kept"]);
    }

    #[tokio::test]
    async fn test_search_predicate_and_order() {
        let table = table().await;
        for (path, ext, size) in [("b.txt", "txt", 10i64), ("a.md", "md", 30), ("c.txt", "txt", 20)] {
            table.insert(&fields(&[("path", path.into()), ("ext", ext.into()), ("size", size.into())])).await.unwrap();
        }
        let predicate = TrustedPredicate::new("ext = 'txt'");
        let records = table.search_all(Some(&predicate), &Order::default()).await.unwrap();
        assert_eq!(paths(&records), ["b.txt", "c.txt"]);

        let records = table.search_all(None, &Order::from("size desc")).await.unwrap();
        assert_eq!(paths(&records), ["a.md", "c.txt", "b.txt"]);

        let records = table.search_all(None, &Order::from(vec!["ext", "path desc"])).await.unwrap();
        assert_eq!(paths(&records), ["a.md", "c.txt", "b.txt"]);

        let records = table.search_all(None, &Order::from("id")).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_search_errors() {
        let table = table().await;
        let err = table.search(None, &Order::from("author")).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Schema(_)));
        // A broken predicate surfaces when the stream is consumed.
        let predicate = TrustedPredicate::new("no_such_column = 1");
        let err = table.search_all(Some(&predicate), &Order::default()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Database));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_load_skips_unrecordable_entries() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join(std::ffi::OsStr::from_bytes(b"bad\xff.txt")), "b").unwrap();
        let table = table().await;
        let scanner = DirectoryScanner::new(dir.path(), ScanOptions::default());
        assert_eq!(table.load(scanner.scan()).await.unwrap(), 1);
        let records = table.search_all(None, &Order::default()).await.unwrap();
        assert_eq!(paths(&records), ["a.txt"]);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_without_autoincrement() {
        for create in ["CREATE TABLE docs (path, name)", "CREATE TABLE docs (id INTEGER PRIMARY KEY, path, name)"] {
            let db = Database::connect_in_memory().await.unwrap();
            sqlx::query(create).execute(db.pool()).await.unwrap();
            let table = IndexTable::open(db.pool().clone(), "docs", &ColumnDefinitions::default(), None).await.unwrap();
            let first = table.insert(&fields(&[("path", "a".into())])).await.unwrap();
            table.remove(first).await.unwrap();
            let second = table.insert(&fields(&[("path", "b".into())])).await.unwrap();
            assert!(second > first, "{create}: {second} reused {first}");
            assert!(matches!(&*table.get(first).await.unwrap_err(), ErrorKind::NotFound(_)));

            // Reloading renumbers rows above everything handed out so far.
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("c.txt"), "c").unwrap();
            table.load(DirectoryScanner::new(dir.path(), ScanOptions::default()).scan()).await.unwrap();
            let records = table.search_all(None, &Order::default()).await.unwrap();
            assert_eq!(records.len(), 1);
            assert!(records[0].id > second);
        }
    }

    #[tokio::test]
    async fn test_rowid_tables() {
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE docs (path, title)").execute(db.pool()).await.unwrap();
        let table = IndexTable::open(db.pool().clone(), "docs", &ColumnDefinitions::default(), None).await.unwrap();
        let id = table.insert(&fields(&[("path", "x".into()), ("title", "X".into())])).await.unwrap();
        let record = table.get(id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.get("title"), Some(&Value::from("X")));
        table.remove(id).await.unwrap();
        assert!(table.search_all(None, &Order::default()).await.unwrap().is_empty());
    }
}
