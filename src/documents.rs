//! The document manager.

use crate::catalog::{Catalog, MemoryCatalog};
use crate::error::{ErrorKind, RaiseExt, Result, StorageResultExt};
use crate::naming::{NamePolicy, NameRequest, NumericSuffix};
use docmgt_config::{Authority, Options};
use docmgt_index::{ColumnDefinitions, Database, DocumentId, Fields, IndexTable, Order, Record, RecordStream, TrustedPredicate};
use docmgt_storage::{LocalDirectory, MetadataStream, Scan, ScanOptions, Value, check_source, to_index_string};
use exn::ResultExt;
use futures::StreamExt;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// SQLite files that sit next to the index database.
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// An open write handle waiting for its `*_close` call.
struct TrackedHandle {
    file: File,
    path: PathBuf,
}

/// Runtime collaborators for [`Documents`] that can't be expressed as
/// configuration.
pub struct DocumentsBuilder {
    options: Options,
    scanner: Option<Arc<dyn Scan>>,
    naming: Option<Arc<dyn NamePolicy>>,
    pool: Option<SqlitePool>,
}

impl DocumentsBuilder {
    pub fn new(options: Options) -> Self {
        Self { options, scanner: None, naming: None, pool: None }
    }

    /// Replace the default directory scanner (used by
    /// [`load_db`](Documents::load_db)).
    pub fn scanner(mut self, scanner: impl Scan + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    /// Replace the default [`NumericSuffix`] name policy.
    pub fn naming(mut self, policy: impl NamePolicy + 'static) -> Self {
        self.naming = Some(Arc::new(policy));
        self
    }

    /// Use an existing connection pool instead of opening
    /// [`Options::index_location`]. The pool is left open when the manager
    /// is closed.
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open the managed directory and the index.
    ///
    /// With [`Authority::Directory`] (the default) the index is rebuilt from a
    /// directory scan before this returns. Without an index, the in-memory
    /// catalog is always built from a scan.
    #[instrument(skip_all, fields(directory = %self.options.directory.display()))]
    pub async fn open(self) -> Result<Documents> {
        let Self { options, scanner, naming, pool } = self;
        options.validate().or_raise(|| ErrorKind::Config)?;
        let directory = LocalDirectory::new(&options.directory).or_kind()?;

        let mut scan_options = ScanOptions::default().recursive(options.recursive).sorted(options.no_index);
        let (catalog, database) = match options.no_index {
            true => (Catalog::Memory(MemoryCatalog::default()), None),
            false => {
                let (database, owned) = match pool {
                    Some(pool) => (Database::from(pool), false),
                    None => (Database::connect(options.index_location()).await.or_kind()?, true),
                };
                if let Some(location) = database.location().await.or_kind()? {
                    for excluded in index_files(&directory, &location) {
                        scan_options = scan_options.exclude(excluded);
                    }
                }
                let definitions = options.columns.parse::<ColumnDefinitions>().or_kind()?;
                let table =
                    IndexTable::open(database.pool().clone(), &options.table, &definitions, options.projection.as_deref())
                        .await
                        .or_kind()?;
                (Catalog::Table(table), owned.then_some(database))
            },
        };
        let scanner = scanner.unwrap_or_else(|| Arc::new(directory.scanner(scan_options)) as Arc<dyn Scan>);

        let mut documents = Documents {
            options,
            directory,
            scanner,
            naming: naming.unwrap_or_else(|| Arc::new(NumericSuffix) as Arc<dyn NamePolicy>),
            catalog,
            database,
            handles: HashMap::new(),
        };
        if documents.options.no_index || documents.options.authority == Authority::Directory {
            documents.load_db().await?;
        }
        Ok(documents)
    }
}

/// Relative paths of the index database and its sidecars, if the database
/// lives inside the managed directory.
fn index_files(directory: &LocalDirectory, location: &Path) -> Vec<PathBuf> {
    let Some(relative) = directory.relative_path(location) else {
        return Vec::new();
    };
    let mut excluded = vec![relative.clone()];
    for suffix in SIDECAR_SUFFIXES {
        let mut name = OsString::from(relative.as_os_str());
        name.push(suffix);
        excluded.push(PathBuf::from(name));
    }
    excluded
}

/// A managed directory of documents, mirrored into a queryable index.
///
/// The directory holds the content; the index holds metadata. Every
/// operation that changes content re-extracts the file's metadata and
/// pushes it into the index, but nothing is transactional across the two:
/// a failure part-way through (say, creating the file after its row was
/// inserted) is reported and logged, not rolled back. [`load_db`](Self::load_db)
/// reconciles the index with whatever is on disk.
///
/// Write handles returned by `create`, `update` and `append` are tracked
/// per document until the matching `*_close` call (or
/// [`close_all`](Self::close_all)), which flushes the file and refreshes its
/// metadata.
///
/// # Examples
///
/// ```no_run
/// use docmgt::{Documents, Options, Order};
/// use tokio::io::AsyncWriteExt;
///
/// # async fn example() -> docmgt::error::Result<()> {
/// let mut documents = Documents::open(Options::new("/srv/documents")).await?;
/// let (file, id) = documents.create(None).await?;
/// file.write_all(b"hello").await.unwrap();
/// documents.create_close(id).await?;
/// assert_eq!(documents.retrieve_all(id).await?, b"hello");
///
/// for record in documents.search_all(None, Order::from("size desc")).await? {
///     println!("{}: {:?}", record.id, record.path());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Documents {
    options: Options,
    directory: LocalDirectory,
    scanner: Arc<dyn Scan>,
    naming: Arc<dyn NamePolicy>,
    catalog: Catalog,
    /// Only set when the manager opened the database itself.
    database: Option<Database>,
    handles: HashMap<DocumentId, TrackedHandle>,
}

impl Documents {
    /// Open a manager with the default scanner and name policy.
    pub async fn open(options: Options) -> Result<Self> {
        DocumentsBuilder::new(options).open().await
    }

    pub fn builder(options: Options) -> DocumentsBuilder {
        DocumentsBuilder::new(options)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn directory(&self) -> &LocalDirectory {
        &self.directory
    }

    /// Whether metadata is kept in a SQLite index (as opposed to the
    /// in-memory catalog of `no_index` mode).
    pub fn is_indexed(&self) -> bool {
        matches!(self.catalog, Catalog::Table(_))
    }

    /// A fresh scan of the managed directory.
    pub fn scan(&self) -> MetadataStream<'_> {
        self.scanner.scan()
    }

    // =========================================================================
    // Handles
    // =========================================================================

    async fn track(&mut self, id: DocumentId, file: File, path: PathBuf) -> &mut File {
        if let Some(mut previous) = self.handles.remove(&id) {
            tracing::warn!(%id, path = %previous.path.display(), "Replacing open handle; the previous handle is orphaned");
            if let Err(err) = previous.file.flush().await {
                tracing::warn!(%id, error = %err, "Failed to flush orphaned handle");
            }
        }
        &mut self.handles.entry(id).insert_entry(TrackedHandle { file, path }).into_mut().file
    }

    /// The tracked write handle for a document, if there is one.
    pub fn handle(&mut self, id: DocumentId) -> Option<&mut File> {
        self.handles.get_mut(&id).map(|tracked| &mut tracked.file)
    }

    /// Flush and release a tracked handle, then refresh the document's
    /// metadata. Does nothing if no handle is tracked, so it is safe to call
    /// twice.
    #[instrument(skip(self))]
    async fn close(&mut self, id: DocumentId) -> Result<()> {
        let Some(TrackedHandle { mut file, path }) = self.handles.remove(&id) else {
            tracing::trace!("No handle tracked");
            return Ok(());
        };
        file.flush().await.or_raise(|| ErrorKind::Io)?;
        drop(file);
        self.resync(id, &path).await
    }

    /// Finish a [`create`](Self::create).
    pub async fn create_close(&mut self, id: DocumentId) -> Result<()> {
        self.close(id).await
    }

    /// Finish an [`update`](Self::update).
    pub async fn update_close(&mut self, id: DocumentId) -> Result<()> {
        self.close(id).await
    }

    /// Finish an [`append`](Self::append).
    pub async fn append_close(&mut self, id: DocumentId) -> Result<()> {
        self.close(id).await
    }

    /// Close every tracked handle.
    pub async fn close_all(&mut self) -> Result<()> {
        let ids: Vec<DocumentId> = self.handles.keys().copied().collect();
        for id in ids {
            self.close(id).await?;
        }
        Ok(())
    }

    /// Close every tracked handle, then the index database (unless it was
    /// supplied through [`DocumentsBuilder::pool`]).
    pub async fn shutdown(mut self) -> Result<()> {
        self.close_all().await?;
        if let Some(database) = self.database.take() {
            database.close().await;
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Re-extract a document's metadata and push it into the index.
    async fn resync(&mut self, id: DocumentId, path: &Path) -> Result<()> {
        let metadata = self.directory.stat(path).await.or_missing(id, path)?;
        self.catalog.refresh(id, &metadata).await.or_kind()
    }

    /// Look up a document's path and make sure its file still exists.
    async fn resolve(&self, id: DocumentId) -> Result<PathBuf> {
        let path = self.catalog.path_of(id).await.or_kind()?;
        if !self.directory.exists(&path).await.or_kind()? {
            exn::bail!(ErrorKind::FileMissing(id, path));
        }
        Ok(path)
    }

    /// Insert a row and give the document a filename. The file itself isn't
    /// touched.
    async fn allocate(&mut self, metadata: Option<&Fields>) -> Result<(DocumentId, PathBuf)> {
        let empty = Fields::new();
        let metadata = metadata.unwrap_or(&empty);
        let id = self.catalog.insert(metadata).await.or_kind()?;
        let extension = metadata.get("role").and_then(Value::as_str).and_then(|role| self.options.extension_for(role));
        let request = NameRequest { id, metadata, extension };
        let path = match self.naming.allocate(&self.directory, request).await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(%id, "No filename allocated; index row is orphaned");
                return Err(err);
            },
        };
        let mut names = Fields::new();
        names.insert("path".to_string(), Value::from(to_index_string(&path).or_kind()?));
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            names.insert("name".to_string(), Value::from(name));
        }
        self.catalog.update(id, &names).await.or_kind()?;
        Ok((id, path))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create an empty document and return a write handle for it.
    ///
    /// Metadata keys matching an index column are stored; others are
    /// dropped. See [`NumericSuffix`] for how the filename is chosen. Finish
    /// with [`create_close`](Self::create_close).
    ///
    /// If the file can't be created the index row stays behind without a
    /// file; [`load_db`](Self::load_db) clears it.
    #[instrument(skip(self, metadata))]
    pub async fn create(&mut self, metadata: Option<&Fields>) -> Result<(&mut File, DocumentId)> {
        let (id, path) = self.allocate(metadata).await?;
        let file = match self.directory.create(&path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(%id, path = %path.display(), "Failed to create file; index row is orphaned");
                return Err(err).or_raise(|| ErrorKind::Io);
            },
        };
        tracing::debug!(%id, path = %path.display(), "Created document");
        Ok((self.track(id, file, path).await, id))
    }

    /// Create a document by copying an external file.
    ///
    /// The source is checked before anything else happens, so an invalid
    /// source never leaves a row behind.
    #[instrument(skip(self, source, metadata), fields(source = %source.as_ref().display()))]
    pub async fn create_from(&mut self, source: impl AsRef<Path>, metadata: Option<&Fields>) -> Result<DocumentId> {
        let source = check_source(source.as_ref()).await.or_source(source.as_ref())?;
        let (id, path) = self.allocate(metadata).await?;
        if let Err(err) = self.directory.copy_from(&source, &path).await {
            tracing::warn!(%id, path = %path.display(), "Failed to copy source; index row is orphaned");
            return Err(err).or_raise(|| ErrorKind::Io);
        }
        self.resync(id, &path).await?;
        tracing::debug!(%id, path = %path.display(), "Created document from source");
        Ok(id)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Open a document for streaming reads.
    pub async fn retrieve(&self, id: DocumentId) -> Result<File> {
        let path = self.resolve(id).await?;
        self.directory.open_read(&path).await.or_missing(id, &path)
    }

    /// Read a document's whole content.
    pub async fn retrieve_all(&self, id: DocumentId) -> Result<Vec<u8>> {
        let path = self.resolve(id).await?;
        self.directory.read(&path).await.or_missing(id, &path)
    }

    /// The index row for a document. Never touches the file, so this works
    /// for stale rows too.
    pub async fn record(&self, id: DocumentId) -> Result<Record> {
        self.catalog.get(id).await.or_kind()
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Truncate a document and return a write handle for it. Finish with
    /// [`update_close`](Self::update_close).
    #[instrument(skip(self))]
    pub async fn update(&mut self, id: DocumentId) -> Result<&mut File> {
        let path = self.resolve(id).await?;
        let file = self.directory.open_overwrite(&path).await.or_missing(id, &path)?;
        Ok(self.track(id, file, path).await)
    }

    /// Return a handle that appends to a document. Finish with
    /// [`append_close`](Self::append_close).
    #[instrument(skip(self))]
    pub async fn append(&mut self, id: DocumentId) -> Result<&mut File> {
        let path = self.resolve(id).await?;
        let file = self.directory.open_append(&path).await.or_missing(id, &path)?;
        Ok(self.track(id, file, path).await)
    }

    /// Replace a document's content with a copy of an external file.
    #[instrument(skip(self, source), fields(source = %source.as_ref().display()))]
    pub async fn update_from(&mut self, id: DocumentId, source: impl AsRef<Path>) -> Result<()> {
        let source = check_source(source.as_ref()).await.or_source(source.as_ref())?;
        let path = self.resolve(id).await?;
        self.directory.copy_from(&source, &path).await.or_missing(id, &path)?;
        self.resync(id, &path).await
    }

    /// Append the content of an external file to a document.
    #[instrument(skip(self, source), fields(source = %source.as_ref().display()))]
    pub async fn append_from(&mut self, id: DocumentId, source: impl AsRef<Path>) -> Result<()> {
        let source = check_source(source.as_ref()).await.or_source(source.as_ref())?;
        let path = self.resolve(id).await?;
        self.directory.append_from(&source, &path).await.or_missing(id, &path)?;
        self.resync(id, &path).await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove a document's file, then its index row.
    ///
    /// If the file can't be removed (including when it's already gone) the
    /// row and any tracked handle are kept. Once the file is gone its tracked
    /// handle is dropped without a refresh.
    #[instrument(skip(self))]
    pub async fn delete(&mut self, id: DocumentId) -> Result<()> {
        let path = self.catalog.path_of(id).await.or_kind()?;
        self.directory.remove(&path).await.or_missing(id, &path)?;
        if self.handles.remove(&id).is_some() {
            tracing::debug!("Dropped open handle of deleted document");
        }
        if let Err(err) = self.catalog.remove(id).await {
            tracing::warn!(path = %path.display(), "File removed but its index row remains");
            return Err(err).or_kind();
        }
        tracing::debug!(path = %path.display(), "Deleted document");
        Ok(())
    }

    // =========================================================================
    // Index
    // =========================================================================

    /// Rebuild the index from a fresh directory scan. Returns the number of
    /// documents found.
    ///
    /// Identifiers are reassigned; ones handed out earlier no longer refer to
    /// anything.
    pub async fn load_db(&mut self) -> Result<u64> {
        let records = self.scanner.scan();
        self.catalog.load(records).await.or_kind()
    }

    /// Query document metadata.
    ///
    /// `predicate` is raw SQL; see [`TrustedPredicate`]. Without an index
    /// only ordering is available and passing a predicate fails with
    /// [`ErrorKind::IndexDisabled`].
    pub fn search(&self, predicate: Option<&TrustedPredicate>, order: impl Into<Order>) -> Result<RecordStream> {
        if predicate.is_some() && !self.is_indexed() {
            exn::bail!(ErrorKind::IndexDisabled);
        }
        self.catalog.search(predicate, &order.into()).or_kind()
    }

    /// [`search`](Self::search), collected.
    pub async fn search_all(&self, predicate: Option<&TrustedPredicate>, order: impl Into<Order>) -> Result<Vec<Record>> {
        let mut stream = self.search(predicate, order)?;
        let mut records = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record.or_kind()?);
        }
        Ok(records)
    }
}

impl Drop for Documents {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::warn!(open = self.handles.len(), "Document manager dropped with open handles; their metadata is stale");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docmgt_storage::DirectoryScanner;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::{TempDir, tempdir};
    use tokio::io::AsyncReadExt;

    async fn open(dir: &TempDir) -> Documents {
        Documents::open(Options::new(dir.path())).await.unwrap()
    }

    async fn paths(documents: &Documents) -> Vec<String> {
        let records = documents.search_all(None, "path").await.unwrap();
        records.iter().map(|r| r.path().unwrap().to_string()).collect()
    }

    fn metadata(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    async fn write_new(documents: &mut Documents, content: &[u8]) -> DocumentId {
        let (file, id) = documents.create(None).await.unwrap();
        file.write_all(content).await.unwrap();
        documents.create_close(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_search_ordered_by_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.nottxt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let documents = open(&dir).await;
        assert!(dir.path().join("docmgt").exists());

        let records = documents.search_all(None, "path").await.unwrap();
        let exts: Vec<_> = records.iter().map(|r| r.get("ext").cloned().unwrap()).collect();
        assert_eq!(paths(&documents).await, ["a.txt", "b.nottxt"]);
        assert_eq!(exts, [Value::from("txt"), Value::from("nottxt")]);
    }

    #[tokio::test]
    async fn test_index_never_indexes_itself() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        write_new(&mut documents, b"content").await;
        documents.load_db().await.unwrap();
        assert_eq!(paths(&documents).await, ["file1"]);
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_names() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let first = write_new(&mut documents, b"").await;
        let second = write_new(&mut documents, b"").await;
        assert_eq!(documents.record(first).await.unwrap().path(), Some("file1"));
        assert_eq!(documents.record(second).await.unwrap().path(), Some("file2"));
        assert!(dir.path().join("file1").is_file());
        assert!(dir.path().join("file2").is_file());
    }

    #[tokio::test]
    async fn test_create_skips_taken_names() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        fs::write(dir.path().join("file1"), "not managed").unwrap();
        let id = write_new(&mut documents, b"").await;
        assert_eq!(documents.record(id).await.unwrap().path(), Some("file1_1"));
    }

    #[tokio::test]
    async fn test_create_round_trip() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let (file, id) = documents.create(None).await.unwrap();
        file.write_all(b"hello ").await.unwrap();
        // The handle can be borrowed again until it is closed.
        documents.handle(id).unwrap().write_all(b"world").await.unwrap();
        documents.create_close(id).await.unwrap();
        documents.create_close(id).await.unwrap();
        assert!(documents.handle(id).is_none());

        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"hello world");
        let record = documents.record(id).await.unwrap();
        assert_eq!(record.get("size"), Some(&Value::Integer(11)));
        assert_eq!(record.get("name"), Some(&Value::from("file1")));
        assert_eq!(record.get("filetype"), Some(&Value::from("-")));

        let mut content = String::new();
        documents.retrieve(id).await.unwrap().read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn test_create_from_copies_source() {
        let dir = tempdir().unwrap();
        let sources = tempdir().unwrap();
        let source = sources.path().join("report.pdf");
        fs::write(&source, "%PDF-1.7").unwrap();
        let mut documents = open(&dir).await;
        let id = documents.create_from(&source, None).await.unwrap();
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"%PDF-1.7");
        assert_eq!(documents.record(id).await.unwrap().get("size"), Some(&Value::Integer(8)));
        // The source is copied, not moved.
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_update_replaces_content() {
        let dir = tempdir().unwrap();
        let sources = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = write_new(&mut documents, b"a much longer original").await;

        documents.update(id).await.unwrap().write_all(b"short").await.unwrap();
        documents.update_close(id).await.unwrap();
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"short");
        assert_eq!(documents.record(id).await.unwrap().get("size"), Some(&Value::Integer(5)));

        let source = sources.path().join("replacement");
        fs::write(&source, "replaced").unwrap();
        documents.update_from(id, &source).await.unwrap();
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"replaced");
        assert_eq!(documents.record(id).await.unwrap().get("size"), Some(&Value::Integer(8)));
    }

    #[tokio::test]
    async fn test_append_concatenates() {
        let dir = tempdir().unwrap();
        let sources = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = write_new(&mut documents, b"one").await;

        documents.append(id).await.unwrap().write_all(b",two").await.unwrap();
        documents.append_close(id).await.unwrap();
        let source = sources.path().join("three");
        fs::write(&source, ",three").unwrap();
        documents.append_from(id, &source).await.unwrap();

        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"one,two,three");
        assert_eq!(documents.record(id).await.unwrap().get("size"), Some(&Value::Integer(13)));
    }

    #[tokio::test]
    async fn test_replacing_a_handle() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = write_new(&mut documents, b"original").await;
        documents.update(id).await.unwrap().write_all(b"first").await.unwrap();
        // The second handle truncates again and replaces the first one.
        documents.update(id).await.unwrap().write_all(b"second").await.unwrap();
        documents.update_close(id).await.unwrap();
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_close_all() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let (file, first) = documents.create(None).await.unwrap();
        file.write_all(b"1").await.unwrap();
        let (file, second) = documents.create(None).await.unwrap();
        file.write_all(b"22").await.unwrap();
        documents.close_all().await.unwrap();
        assert!(documents.handle(first).is_none());
        assert_eq!(documents.record(second).await.unwrap().get("size"), Some(&Value::Integer(2)));
        documents.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = write_new(&mut documents, b"doomed").await;
        documents.delete(id).await.unwrap();
        assert!(!dir.path().join("file1").exists());
        assert!(paths(&documents).await.is_empty());
        assert!(matches!(&*documents.retrieve(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*documents.retrieve_all(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*documents.record(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*documents.delete(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        // Identifiers aren't reused.
        let next = write_new(&mut documents, b"").await;
        assert!(next > id);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = DocumentId::new(42);
        assert!(matches!(&*documents.retrieve_all(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*documents.update(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(matches!(&*documents.append(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        // Closing something that was never opened is a no-op.
        documents.create_close(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let id = write_new(&mut documents, b"here today").await;
        fs::remove_file(dir.path().join("file1")).unwrap();

        assert!(matches!(&*documents.retrieve_all(id).await.unwrap_err(), ErrorKind::FileMissing(..)));
        assert!(matches!(&*documents.update(id).await.unwrap_err(), ErrorKind::FileMissing(..)));
        // Metadata is still readable, and a failed delete keeps the row.
        assert_eq!(documents.record(id).await.unwrap().path(), Some("file1"));
        assert!(matches!(&*documents.delete(id).await.unwrap_err(), ErrorKind::FileMissing(..)));
        assert!(documents.record(id).await.is_ok());

        documents.load_db().await.unwrap();
        assert!(paths(&documents).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_handle() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let (_, id) = documents.create(None).await.unwrap();
        fs::remove_file(dir.path().join("file1")).unwrap();
        assert!(matches!(&*documents.delete(id).await.unwrap_err(), ErrorKind::FileMissing(..)));
        assert!(documents.handle(id).is_some());
        assert!(matches!(&*documents.delete(DocumentId::new(42)).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert!(documents.handle(id).is_some());
    }

    #[tokio::test]
    async fn test_failed_create_orphans_row() {
        let dir = tempdir().unwrap();
        let sources = tempdir().unwrap();
        let source = sources.path().join("source.txt");
        fs::write(&source, "content").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut documents = open(&dir).await;
        let target = metadata(&[("path", "sub")]);

        let err = documents.create(Some(&target)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io));
        let err = documents.create_from(&source, Some(&target)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io));

        let orphans = [DocumentId::new(1), DocumentId::new(2)];
        for id in orphans {
            assert_eq!(documents.record(id).await.unwrap().path(), Some("sub"));
            assert!(documents.handle(id).is_none());
        }
        documents.load_db().await.unwrap();
        for id in orphans {
            assert!(matches!(&*documents.record(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        }
        assert!(paths(&documents).await.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_open_skips_unrecordable_names() {
        use std::os::unix::ffi::OsStrExt;

        for no_index in [false, true] {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("a.txt"), "a").unwrap();
            fs::write(dir.path().join(std::ffi::OsStr::from_bytes(b"bad\xff.txt")), "b").unwrap();
            let mut documents = Documents::open(Options { no_index, ..Options::new(dir.path()) }).await.unwrap();
            assert_eq!(paths(&documents).await, ["a.txt"]);
            assert_eq!(documents.load_db().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_invalid_sources() {
        let dir = tempdir().unwrap();
        let sources = tempdir().unwrap();
        let mut documents = open(&dir).await;
        let missing = sources.path().join("missing");

        let err = documents.create_from(&missing, None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SourceNotFound(_)));
        let err = documents.create_from(sources.path(), None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SourceNotAFile(_)));
        // Nothing was allocated.
        assert!(paths(&documents).await.is_empty());

        let id = write_new(&mut documents, b"keep").await;
        let err = documents.update_from(id, &missing).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SourceNotFound(_)));
        let err = documents.append_from(id, sources.path()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SourceNotAFile(_)));
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_load_db_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut documents = open(&dir).await;
        write_new(&mut documents, b"managed").await;
        fs::write(dir.path().join("external.txt"), "dropped in").unwrap();
        assert_eq!(paths(&documents).await, ["file1"]);

        assert_eq!(documents.load_db().await.unwrap(), 2);
        let first = paths(&documents).await;
        assert_eq!(documents.load_db().await.unwrap(), 2);
        assert_eq!(paths(&documents).await, first);
        assert_eq!(first, ["external.txt", "file1"]);
    }

    #[tokio::test]
    async fn test_create_metadata() {
        let dir = tempdir().unwrap();
        let options = Options { columns: "path, name, ext, size integer, author text".to_string(), ..Options::new(dir.path()) };
        let mut documents = Documents::open(options).await.unwrap();

        let fields = metadata(&[("path", "notes/today.txt"), ("author", "me"), ("colour", "blue")]);
        let (file, id) = documents.create(Some(&fields)).await.unwrap();
        file.write_all(b"notes").await.unwrap();
        documents.create_close(id).await.unwrap();
        assert!(dir.path().join("notes/today.txt").is_file());

        let record = documents.record(id).await.unwrap();
        assert_eq!(record.path(), Some("notes/today.txt"));
        assert_eq!(record.get("name"), Some(&Value::from("today.txt")));
        assert_eq!(record.get("ext"), Some(&Value::from("txt")));
        assert_eq!(record.get("author"), Some(&Value::from("me")));
        assert_eq!(record.get("colour"), None);

        write_new(&mut documents, b"anonymous").await;
        let predicate = TrustedPredicate::new("author = 'me'");
        let found = documents.search_all(Some(&predicate), Order::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[tokio::test]
    async fn test_role_extensions() {
        let dir = tempdir().unwrap();
        let extensions = BTreeMap::from([("report".to_string(), "pdf".to_string())]);
        let mut documents = Documents::open(Options { extensions, ..Options::new(dir.path()) }).await.unwrap();
        let (_, id) = documents.create(Some(&metadata(&[("role", "report")]))).await.unwrap();
        documents.create_close(id).await.unwrap();
        let record = documents.record(id).await.unwrap();
        assert_eq!(record.path(), Some("file1.pdf"));
        assert_eq!(record.get("ext"), Some(&Value::from("pdf")));
        // Roles without an extension get a bare name.
        let (_, id) = documents.create(Some(&metadata(&[("role", "memo")]))).await.unwrap();
        documents.create_close(id).await.unwrap();
        assert_eq!(documents.record(id).await.unwrap().path(), Some("file2"));
    }

    #[tokio::test]
    async fn test_search_errors() {
        let dir = tempdir().unwrap();
        let documents = open(&dir).await;
        let err = documents.search(None, "author").err().unwrap();
        assert!(matches!(&*err, ErrorKind::Schema));
        let predicate = TrustedPredicate::new("this is not sql");
        let err = documents.search_all(Some(&predicate), "path").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Index));
    }

    #[tokio::test]
    async fn test_invalid_schema() {
        let dir = tempdir().unwrap();
        let options = Options { table: "files; --".to_string(), ..Options::new(dir.path()) };
        let err = Documents::open(options).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Schema));
        let options = Options { projection: Some(vec!["author".to_string()]), ..Options::new(dir.path()) };
        let err = Documents::open(options).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Schema));
        let options = Options { table: String::new(), ..Options::new(dir.path()) };
        let err = Documents::open(options).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Config));
    }

    #[tokio::test]
    async fn test_index_authority() {
        let dir = tempdir().unwrap();
        let id = {
            let mut documents = open(&dir).await;
            let id = write_new(&mut documents, b"kept").await;
            documents.shutdown().await.unwrap();
            id
        };
        fs::write(dir.path().join("external.txt"), "unseen").unwrap();

        let options = Options { authority: Authority::Index, ..Options::new(dir.path()) };
        let mut documents = Documents::open(options).await.unwrap();
        // Existing rows (and ids) are trusted as they are.
        assert_eq!(paths(&documents).await, ["file1"]);
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"kept");
        documents.load_db().await.unwrap();
        assert_eq!(paths(&documents).await, ["external.txt", "file1"]);
    }

    #[tokio::test]
    async fn test_external_index_location() {
        let dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let location = elsewhere.path().join("index.sqlite");
        let options = Options { index_location: Some(location.clone()), ..Options::new(dir.path()) };
        let mut documents = Documents::open(options).await.unwrap();
        write_new(&mut documents, b"").await;
        assert!(location.exists());
        assert!(!dir.path().join("docmgt").exists());
        assert_eq!(paths(&documents).await, ["file1"]);
    }

    #[tokio::test]
    async fn test_supplied_pool() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let documents = Documents::builder(Options::new(dir.path())).pool(db.pool().clone()).open().await.unwrap();
        assert_eq!(paths(&documents).await, ["a.txt"]);
        documents.shutdown().await.unwrap();
        // The manager doesn't close a pool it didn't open.
        assert!(!db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_recursive_scans() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "n").unwrap();
        fs::write(dir.path().join("top.txt"), "t").unwrap();
        let documents = open(&dir).await;
        assert_eq!(paths(&documents).await, ["top.txt"]);
        let documents = Documents::open(Options { recursive: true, ..Options::new(dir.path()) }).await.unwrap();
        assert_eq!(paths(&documents).await, ["sub/nested.txt", "top.txt"]);
    }

    #[tokio::test]
    async fn test_custom_collaborators() {
        struct Fixed;
        #[async_trait]
        impl NamePolicy for Fixed {
            async fn allocate(&self, _: &LocalDirectory, request: NameRequest<'_>) -> Result<PathBuf> {
                Ok(PathBuf::from(format!("doc-{}.bin", request.id)))
            }
        }
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        fs::create_dir(&inbox).unwrap();
        fs::write(inbox.join("ignored.txt"), "i").unwrap();
        fs::write(dir.path().join("root.txt"), "r").unwrap();
        // Only ever index the root directory, even though the options ask for recursion.
        let mut scan_options = ScanOptions::default();
        for excluded in ["docmgt", "docmgt-wal", "docmgt-shm", "docmgt-journal"] {
            scan_options = scan_options.exclude(excluded);
        }
        let scanner = DirectoryScanner::new(dir.path(), scan_options);
        let mut documents = Documents::builder(Options { recursive: true, ..Options::new(dir.path()) })
            .scanner(scanner)
            .naming(Fixed)
            .open()
            .await
            .unwrap();
        let id = write_new(&mut documents, b"").await;
        assert_eq!(documents.record(id).await.unwrap().path(), Some("doc-2.bin"));
        assert_eq!(documents.load_db().await.unwrap(), 2);
        assert_eq!(paths(&documents).await, ["doc-2.bin", "root.txt"]);
    }

    #[tokio::test]
    async fn test_without_index() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.nottxt"), "bb").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let mut documents = Documents::open(Options { no_index: true, ..Options::new(dir.path()) }).await.unwrap();
        assert!(!documents.is_indexed());
        assert!(!dir.path().join("docmgt").exists());

        let records = documents.search_all(None, "path").await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(paths(&documents).await, ["a.txt", "b.nottxt"]);
        assert_eq!(records[1].get("ext"), Some(&Value::from("nottxt")));

        let predicate = TrustedPredicate::new("ext = 'txt'");
        let err = documents.search(Some(&predicate), "path").err().unwrap();
        assert!(matches!(&*err, ErrorKind::IndexDisabled));

        let id = write_new(&mut documents, b"memory").await;
        assert_eq!(id, DocumentId::new(3));
        assert_eq!(documents.record(id).await.unwrap().path(), Some("file3"));
        assert_eq!(documents.retrieve_all(id).await.unwrap(), b"memory");
        documents.delete(id).await.unwrap();
        assert!(matches!(&*documents.retrieve_all(id).await.unwrap_err(), ErrorKind::NotFound(_)));
        assert_eq!(paths(&documents).await, ["a.txt", "b.nottxt"]);
    }
}
