//! Metadata extraction.
//!
//! Turns a filesystem entry into the fixed-shape record that both the
//! directory scanner and the index work with. Nothing here is authoritative:
//! a record is always re-derived from the bytes on disk.

use crate::error::{ErrorKind, Result};
use crate::path::{to_index_string, validate as validate_path};
use crate::value::Value;
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use std::fs::Metadata as FsMetadata;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::instrument;

/// Names of the fields produced by [`Metadata`], in their canonical order.
pub const FIELDS: [&str; 9] = ["path", "name", "ext", "filetype", "modestr", "size", "uid", "gid", "mtime"];

/// Index column definitions (`name [type], ...`) holding every field in
/// [`FIELDS`], used when the index table has to be created.
pub const DEFAULT_COLUMNS: &str = "path, name, ext, filetype, modestr, size integer, uid integer, gid integer, mtime integer";

/// Single-character file type, using the same vocabulary as `ls -l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FileType {
    #[display("-")]
    Regular,
    #[display("d")]
    Directory,
    #[display("l")]
    Symlink,
    #[display("p")]
    Fifo,
    #[display("s")]
    Socket,
    #[display("c")]
    CharDevice,
    #[display("b")]
    BlockDevice,
    #[display("?")]
    Unknown,
}
impl From<std::fs::FileType> for FileType {
    fn from(kind: std::fs::FileType) -> Self {
        if kind.is_file() {
            return Self::Regular;
        }
        if kind.is_dir() {
            return Self::Directory;
        }
        if kind.is_symlink() {
            return Self::Symlink;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if kind.is_fifo() {
                return Self::Fifo;
            }
            if kind.is_socket() {
                return Self::Socket;
            }
            if kind.is_char_device() {
                return Self::CharDevice;
            }
            if kind.is_block_device() {
                return Self::BlockDevice;
            }
        }
        Self::Unknown
    }
}

/// Metadata describing a single file in the managed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Relative path from the managed directory, `/`-separated.
    pub path: String,
    /// Final filename component, extension included.
    pub name: String,
    /// Extension without the leading dot (empty when there isn't one).
    pub ext: String,
    pub filetype: FileType,
    /// Permission bits (including setuid/setgid/sticky).
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub modified: OffsetDateTime,
}

impl Metadata {
    /// Build a record from already-fetched filesystem metadata.
    ///
    /// The scanner gets metadata for free from directory entries, so this is
    /// shared between scanning and [`extract`].
    pub fn from_fs(relative: impl AsRef<Path>, metadata: &FsMetadata) -> Result<Self> {
        let relative = relative.as_ref();
        let path = to_index_string(relative)?;
        let name = relative
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_raise(|| ErrorKind::InvalidPath(relative.to_path_buf()))?
            .to_string();
        i64::try_from(metadata.len()).or_raise(|| ErrorKind::InvalidData("file size"))?;
        let modified = metadata.modified().map_err(|e| ErrorKind::from_io(e, relative))?.into();
        let (mode, uid, gid) = ownership(metadata);
        Ok(Self {
            path,
            ext: extension(&name).to_string(),
            name,
            filetype: metadata.file_type().into(),
            mode,
            size: metadata.len(),
            uid,
            gid,
            modified,
        })
    }

    /// The record's path as a [`PathBuf`] relative to the managed directory.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Nine-character `rwx` permission string, e.g. `rw-r--r--`.
    pub fn modestr(&self) -> String {
        mode_string(self.mode)
    }

    /// Look up a field by its record name (see [`FIELDS`]).
    pub fn get(&self, field: &str) -> Option<Value> {
        Some(match field {
            "path" => Value::from(self.path.as_str()),
            "name" => Value::from(self.name.as_str()),
            "ext" => Value::from(self.ext.as_str()),
            "filetype" => Value::from(self.filetype.to_string()),
            "modestr" => Value::from(self.modestr()),
            // Checked on construction.
            "size" => Value::Integer(self.size as i64),
            "uid" => Value::from(self.uid),
            "gid" => Value::from(self.gid),
            "mtime" => Value::Integer(self.modified.unix_timestamp()),
            _ => return None,
        })
    }

    /// All fields in [`FIELDS`] order.
    pub fn fields(&self) -> Vec<(&'static str, Value)> {
        FIELDS.iter().filter_map(|field| self.get(field).map(|value| (*field, value))).collect()
    }
}

/// Extract metadata for a file relative to `root`.
///
/// Symlinks are not followed. Returns [`NotFound`](ErrorKind::NotFound) when
/// the file has disappeared by the time it is inspected, which can happen
/// even if the caller checked for its existence moments before.
#[instrument(level = "trace", skip(root), fields(root = %root.as_ref().display()))]
pub async fn extract(root: impl AsRef<Path>, relative: impl AsRef<Path> + std::fmt::Debug) -> Result<Metadata> {
    let relative = validate_path(relative)?;
    let absolute = root.as_ref().join(&relative);
    let metadata = tokio::fs::symlink_metadata(&absolute).await.map_err(|e| ErrorKind::from_io(e, &relative))?;
    Metadata::from_fs(&relative, &metadata)
}

fn extension(name: &str) -> &str {
    match name.rfind('.') {
        // Dotfiles like `.profile` have no extension.
        None | Some(0) => "",
        Some(pos) => &name[pos + 1..],
    }
}

#[cfg(unix)]
fn ownership(metadata: &FsMetadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(metadata: &FsMetadata) -> (u32, u32, u32) {
    let mode = match metadata.permissions().readonly() {
        true => 0o444,
        false => 0o666,
    };
    (mode, 0, 0)
}

fn mode_string(mode: u32) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    // (bit, position, when executable, when not executable)
    const SPECIAL: [(u32, usize, char, char); 3] = [(0o4000, 2, 's', 'S'), (0o2000, 5, 's', 'S'), (0o1000, 8, 't', 'T')];
    let mut chars: Vec<char> = BITS.iter().map(|(bit, c)| if mode & bit != 0 { *c } else { '-' }).collect();
    for (bit, pos, exec, no_exec) in SPECIAL {
        if mode & bit != 0 {
            chars[pos] = if chars[pos] == 'x' { exec } else { no_exec };
        }
    }
    chars.into_iter().collect()
}
