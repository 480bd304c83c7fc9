//! Managed directory on the local filesystem.
//!
//! All document paths are relative to the managed directory and validated
//! before use. Operations go through `tokio::fs`; there is no locking, so
//! concurrent writers to the same file are not coordinated.

use crate::error::{ErrorKind, Result};
use crate::metadata::{Metadata, extract};
use crate::path::validate as validate_path;
use crate::scan::{DirectoryScanner, ScanOptions};
use exn::ResultExt;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// The directory under which all documents live.
///
/// # Examples
///
/// ```no_run
/// use docmgt_storage::LocalDirectory;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let documents = LocalDirectory::new("/srv/documents")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    root: PathBuf,
}
impl LocalDirectory {
    /// Open (creating if necessary) a managed directory.
    ///
    /// Relative roots are resolved against the current working directory, and
    /// the result is canonicalized so that later prefix comparisons (is the
    /// index file inside this directory?) are reliable.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the root exists but
    /// is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root.to_path_buf()));
            }
        } else {
            // Use non-async here; it'll only happen once on initialization
            // and it's not worth the hassle of making the constructor async.
            sync_create_dir(root).map_err(|e| ErrorKind::from_io(e, root))?;
        }
        let root = root.canonicalize().map_err(|e| ErrorKind::from_io(e, root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative document path.
    pub fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a path relative to the root, if it
    /// lives inside the managed directory at all.
    pub fn relative_path(&self, absolute: impl AsRef<Path>) -> Option<PathBuf> {
        let absolute = absolute.as_ref();
        // The file may not exist yet; canonicalize what we can.
        let absolute = match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => parent.canonicalize().ok()?.join(name),
            _ => return None,
        };
        let relative = absolute.strip_prefix(&self.root).ok()?;
        validate_path(relative).ok()
    }

    /// A scanner over this directory.
    pub fn scanner(&self, options: ScanOptions) -> DirectoryScanner {
        DirectoryScanner::new(self.root.clone(), options)
    }

    /// Extract the metadata record for a document.
    pub async fn stat(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        extract(&self.root, path.as_ref()).await
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    /// Create (or truncate) a file for writing, creating parent directories
    /// as needed.
    pub async fn create(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        Ok(File::create(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Open an existing file, truncating it.
    pub async fn open_overwrite(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        let mut options = OpenOptions::new();
        options.write(true).truncate(true);
        Ok(options.open(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Open an existing file for appending.
    pub async fn open_append(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        let mut options = OpenOptions::new();
        options.append(true);
        Ok(options.open(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Open an existing file for streaming reads.
    pub async fn open_read(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        Ok(File::open(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Replace a document's contents with a copy of an external file.
    ///
    /// The target is created if it doesn't exist. Returns the number of
    /// bytes copied.
    pub async fn copy_from(&self, source: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<u64> {
        let source = check_source(source).await?;
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        Ok(fs::copy(&source, &abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Append the contents of an external file to an existing document.
    pub async fn append_from(&self, source: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<u64> {
        let source = check_source(source).await?;
        let mut reader = File::open(&source).await.map_err(|e| ErrorKind::from_io(e, &source))?;
        let mut writer = self.open_append(path).await?;
        let copied = tokio::io::copy(&mut reader, &mut writer).await.map_err(ErrorKind::Io)?;
        writer.flush().await.map_err(ErrorKind::Io)?;
        Ok(copied)
    }

    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }
}

/// Make sure an external source for a copy or append is an existing regular
/// file. Returns [`NotFound`](ErrorKind::NotFound) or
/// [`NotAFile`](ErrorKind::NotAFile) otherwise.
pub async fn check_source(source: impl AsRef<Path>) -> Result<PathBuf> {
    let source = source.as_ref();
    let metadata = fs::metadata(source).await.map_err(|e| ErrorKind::from_io(e, source))?;
    if !metadata.is_file() {
        exn::bail!(ErrorKind::NotAFile(source.to_path_buf()));
    }
    // Resolved path, so that the copy reads the same file we just checked
    // even if the working directory changes in between.
    source.canonicalize().or_raise(|| ErrorKind::NotFound(source.to_path_buf()))
}
