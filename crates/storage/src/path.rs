//! Path validation and conversion utilities.
//!
//! Every document path is stored relative to the managed directory. This
//! module makes sure those paths can't escape it, and converts them into the
//! `/`-separated strings that end up in the index.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};
use exn::OptionExt;

/// Validates a document path for security and correctness.
/// Ensures that paths don't escape the managed directory (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use docmgt_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("reports/q1.txt").is_ok());
/// assert!(validate_path("a/../file1").is_ok()); // (never leaves the managed directory)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/.././correct//./file1/").unwrap(),
///     Path::new("correct/file1")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls, reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Render a validated relative path as the `/`-separated string stored in
/// the index, regardless of platform separator.
pub fn to_index_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_raise(|| ErrorKind::InvalidData("path is not valid UTF-8"))?;
    Ok(parts.join("/"))
}
