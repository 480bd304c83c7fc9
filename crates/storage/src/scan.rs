//! Directory scanning.
//!
//! A scan walks the managed directory and yields one [`Metadata`] record per
//! regular file. Scans are restartable (every call to [`Scan::scan`] walks
//! the directory again) but not live: anything that needs current data must
//! ask for a fresh stream.
//!
//! Failing to list the root is reported as-is. Anything below it (an entry
//! that can't be recorded, a subdirectory that can't be listed) is reported
//! as [`ErrorKind::Unreadable`] and the walk carries on.

use crate::error::{ErrorKind, Result};
use crate::metadata::Metadata;
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs::{self, DirEntry};

pub type MetadataStream<'a> = Pin<Box<dyn Stream<Item = Result<Metadata>> + Send + 'a>>;

/// Anything that can produce a fresh sequence of document records.
///
/// The default implementation is [`DirectoryScanner`]; callers can supply
/// their own (a pre-built listing, a filtered view, ...) wherever a scanner
/// is accepted.
pub trait Scan: Send + Sync {
    fn scan(&self) -> MetadataStream<'_>;
}
impl<T: Scan + ?Sized> Scan for Arc<T> {
    fn scan(&self) -> MetadataStream<'_> {
        (**self).scan()
    }
}

/// Options controlling a [`DirectoryScanner`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Yield records ordered by path. Requires the whole listing to be
    /// buffered before the first record is produced.
    pub sorted: bool,
    /// Relative paths that must never appear in the output (the index's own
    /// database file when it lives inside the managed directory).
    pub exclude: HashSet<PathBuf>,
}
impl ScanOptions {
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.insert(path.into());
        self
    }
}

enum WalkEntry {
    File(Metadata),
    Descend(PathBuf),
    Skip,
}

/// Scans a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    root: PathBuf,
    options: ScanOptions,
}
impl DirectoryScanner {
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Self {
        Self { root: root.into(), options }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Walk the directory tree in filesystem order.
    fn walk(&self) -> MetadataStream<'_> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // The directory was removed between being listed and
                    // being walked; nothing to report.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(self.listing_error(err, &current));
                        continue 'dirs;
                    }
                };
                loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(err) => {
                            yield Err(self.listing_error(err, &current));
                            continue 'dirs;
                        },
                    };
                    let path = entry.path();
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(err) => yield Err(err.raise(ErrorKind::Unreadable(path))),
                    };
                }
            }
        })
    }

    /// Failing to list the root ends the scan's usefulness; failing to list a
    /// subdirectory only loses that subtree.
    fn listing_error(&self, err: std::io::Error, directory: &Path) -> exn::Exn<ErrorKind> {
        let err = exn::Exn::from(ErrorKind::from_io(err, directory));
        match directory == self.root {
            true => err,
            false => err.raise(ErrorKind::Unreadable(directory.to_path_buf())),
        }
    }

    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        // DirEntry::metadata() does not traverse symlinks.
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        if metadata.is_dir() {
            return Ok(match self.options.recursive {
                true => WalkEntry::Descend(path),
                false => WalkEntry::Skip,
            });
        }
        if !metadata.is_file() {
            // Symlinks, sockets and friends are not documents.
            return Ok(WalkEntry::Skip);
        }
        let relative = path.strip_prefix(&self.root).map_err(|_| ErrorKind::InvalidPath(path.clone()))?;
        if self.options.exclude.contains(relative) {
            tracing::trace!(path = %relative.display(), "Excluding file from scan");
            return Ok(WalkEntry::Skip);
        }
        Ok(WalkEntry::File(Metadata::from_fs(relative, &metadata)?))
    }
}

impl Scan for DirectoryScanner {
    fn scan(&self) -> MetadataStream<'_> {
        if !self.options.sorted {
            return self.walk();
        }
        let walk = self.walk();
        Box::pin(stream! {
            let mut items: Vec<Result<Metadata>> = walk.collect().await;
            // Errors first (they have no path to sort by), then by path
            // components so that "a/b" sorts before "a.txt" the same way a
            // recursive listing would.
            items.sort_by(|a, b| match (a, b) {
                (Ok(a), Ok(b)) => Path::new(&a.path).cmp(Path::new(&b.path)),
                (Err(_), Ok(_)) => std::cmp::Ordering::Less,
                (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => std::cmp::Ordering::Equal,
            });
            for item in items {
                yield item;
            }
        })
    }
}
