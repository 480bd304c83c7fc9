//! Filename allocation for new documents.

use crate::error::{RaiseExt, Result};
use async_trait::async_trait;
use docmgt_index::{DocumentId, Fields};
use docmgt_storage::{LocalDirectory, validate_path};
use std::path::PathBuf;

/// Everything a [`NamePolicy`] gets to decide a new document's filename.
#[derive(Debug, Clone, Copy)]
pub struct NameRequest<'a> {
    /// Identifier the index just assigned to the document.
    pub id: DocumentId,
    /// Metadata the caller passed to `create`.
    pub metadata: &'a Fields,
    /// Extension configured for the document's role (no leading dot).
    pub extension: Option<&'a str>,
}

/// Decides where a newly created document is stored.
///
/// Implementations return a path relative to the managed directory. The
/// manager creates the file straight afterwards, so a policy that checks for
/// existence first is racy against other creators; swap in a policy with
/// atomic allocation if that matters.
#[async_trait]
pub trait NamePolicy: Send + Sync {
    async fn allocate(&self, directory: &LocalDirectory, request: NameRequest<'_>) -> Result<PathBuf>;
}

/// The default policy.
///
/// - A `path` (or failing that, `name`) metadata value is used verbatim, even
///   if a file already exists there.
/// - Otherwise the name is `file<id>`, plus the role's extension if there is
///   one. If that's taken, `_1`, `_2`, ... is appended to the stem until a
///   free name is found.
///
/// Existence is checked before the file is created, so two managers creating
/// documents in the same directory at the same time can pick the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericSuffix;

impl NumericSuffix {
    const PREFIX: &'static str = "file";

    fn candidate(stem: &str, attempt: u32, extension: Option<&str>) -> String {
        let mut name = match attempt {
            0 => stem.to_string(),
            n => format!("{stem}_{n}"),
        };
        if let Some(extension) = extension {
            name.push('.');
            name.push_str(extension);
        }
        name
    }
}

#[async_trait]
impl NamePolicy for NumericSuffix {
    async fn allocate(&self, directory: &LocalDirectory, request: NameRequest<'_>) -> Result<PathBuf> {
        let explicit = ["path", "name"].iter().find_map(|key| request.metadata.get(*key).and_then(|v| v.as_str()));
        if let Some(explicit) = explicit {
            return validate_path(explicit).or_kind();
        }
        let stem = format!("{}{}", Self::PREFIX, request.id);
        let mut attempt = 0;
        loop {
            let candidate = PathBuf::from(Self::candidate(&stem, attempt, request.extension));
            if !directory.exists(&candidate).await.or_kind()? {
                return Ok(candidate);
            }
            tracing::debug!(id = %request.id, path = %candidate.display(), "Filename taken, trying next suffix");
            attempt += 1;
        }
    }
}
